//! The message-send pipeline: reconcile a client chat turn with stored state,
//! admit it through the quota and relay the model's answer.

mod active;
mod error;
mod reconciler;
mod relay;
mod request;

pub use active::ActiveGenerations;
pub use error::TurnError;
pub use reconciler::{PreparedTurn, TurnReconciler};
pub use relay::{StreamEvent, StreamRelay};
pub use request::{ChatTurnRequest, IncomingMessage, Trigger, ValidatedTurn};
