pub mod listener;
pub mod reactor;
pub mod session;
pub mod signals;

pub use listener::{parse_listen_address, Listener};
pub use reactor::{Reactor, TurnReport, WAKE};
pub use session::{AcceptConfig, Dispatch, Session};
pub use signals::{SignalBridge, SignalFlags};
