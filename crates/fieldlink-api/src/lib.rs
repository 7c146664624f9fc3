//! Field transports for fieldlink.
//!
//! - [`bacnet`]: BACnet/IP ReadPropertyMultiple codec and a shared UDP
//!   client with invoke-id routing and per-request timeouts.
//! - [`rest`]: JSON polling client for remote HTTP services.
//!
//! No pipeline logic lives here; `fieldlink-core` builds controllers on
//! top of these transports.

pub mod bacnet;
pub mod error;
pub mod rest;

pub use bacnet::{
    ApplicationValue, BacnetClient, BacnetClientConfig, ObjectId, ObjectType, PropertyError,
    PropertyId, PropertyResult, ReadAccessResult, ReadAccessSpec, ReadPropertyMultiple,
    UNKNOWN_OBJECT_ERROR_CODE,
};
pub use error::Error;
pub use rest::{BasicAuth, RestClient, RestClientConfig};
