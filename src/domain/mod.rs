//! Canonical mail model.
//!
//! Provider-independent types every driver translates to and from: messages,
//! thread projections, labels, outgoing payloads, drafts and the stored
//! connection record. Pure data, no provider behavior.

mod account;
mod connection;
mod draft;
mod label;
mod message;
mod outgoing;
mod thread;
mod types;

pub use account::{EmailAlias, FolderCount, OAuthTokens, ProviderId, SendReceipt, UserInfo};
pub use connection::{Connection, TokenUpdate};
pub use draft::{Draft, DraftInput, DraftPage, DraftReceipt};
pub use label::{Label, LabelChanges, LabelColor, LabelInput};
pub use message::{subject_or_default, Attachment, ParsedMessage, Sender, NO_SUBJECT};
pub use outgoing::{Address, OutgoingAttachment, OutgoingMessage};
pub use thread::{Thread, ThreadDetail, ThreadPage};
pub use types::{id_or_unknown, ConnectionId, UNKNOWN_ID};
