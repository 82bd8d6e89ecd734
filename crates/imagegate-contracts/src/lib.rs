pub mod errors;
pub mod events;
pub mod profiles;
pub mod request;
pub mod summary;

pub use errors::{ClassifiedError, PreflightError};
pub use events::{EventWriter, GenerationEvent};
pub use profiles::{ProfileRegistry, ProviderProfile};
pub use request::{GenerationRequest, GenerationRequestBuilder};
