pub mod builder;
pub mod codec;
pub mod config;
pub mod normalizer;
pub mod orchestrator;
pub mod retry;
pub mod transport;

pub use builder::{CallBody, RequestBuilder, TransportCall};
pub use codec::{DecodedImage, EncodeError, ImageCodec, OutputFormat, SourceFormat};
pub use config::{credential_env_key, ConfigError, Credentials, GatewayConfig};
pub use normalizer::ResponseNormalizer;
pub use orchestrator::{GenerationResult, Orchestrator, SlotDiagnostics, SlotOutcome};
pub use retry::{RetryDecision, RetryPolicy};
pub use transport::{DryrunTransport, HttpTransport, RawProviderResponse, Transport};

pub use imagegate_contracts::{
    errors::{ClassifiedError, PreflightError},
    events::{EventWriter, GenerationEvent},
    profiles::{ProfileRegistry, ProviderProfile},
    request::GenerationRequest,
};
