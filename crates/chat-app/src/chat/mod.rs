pub mod groups;
pub mod message;
pub mod pipeline;
pub mod registry;

pub use groups::{GroupEntry, MessageGroup, MessageGroups};
pub use message::{DEFAULT_SESSION_NAME, Message, Sender, Session};
pub use pipeline::{
    AppendOutcome, ChatPipeline, EMPTY_REPLY_MESSAGE, NETWORK_FAILURE_MESSAGE, PendingSend,
    PipelineError, PipelineOptions, PipelineResult, RequestTarget, SendOutcome, TitleRequest,
};
pub use registry::{RegistryError, RegistryResult, SessionRegistry};
