pub mod client;
pub mod constants;
pub mod frame;
pub mod handshake;
pub mod interface;
pub mod message;
pub mod request;
pub mod response;
pub mod timing;

pub use interface::{
    ConnectionStatus, Interface, InterfaceEvent, InterfaceSettings, Link, MessageId,
    ResponsesFinished,
};
pub use message::Message;
pub use request::Request;
