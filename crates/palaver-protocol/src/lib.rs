//! XML stream handling for palaver.
//!
//! - [`stream`]: incremental framing of the byte stream into elements
//! - [`dispatcher`]: priority-ordered handler dispatch and the outbound queue
//! - [`sm`]: stream management acknowledgement and resumption state

pub mod dispatcher;
pub mod element;
pub mod error;
pub mod ns;
pub mod sm;
pub mod stanza;
pub mod stream;

pub use dispatcher::{
    ANY_NAME, Dispatcher, Handled, HandlerId, HandlerSpec, Outbox, Outgoing, Priority,
    ProcessOutcome, StreamState,
};
pub use element::{Element, Node};
pub use error::{NegotiationError, ProtocolError, ProtocolResult};
pub use sm::{SmAction, SmEvent, SmNotice, SmState, StreamManaged, StreamManagement};
pub use stanza::{Stanza, StanzaKind};
pub use stream::{FrameEvent, StreamFramer, StreamHeader};
