pub mod decoder;
pub mod registry;
pub mod scanner;

pub use decoder::{device_type, DecoderTable};
pub use registry::{BeaconRegistry, BeaconTarget};
pub use scanner::{AdvertisementScanner, BluezScanner, RawAdvertisement, ScanError};
