#![forbid(unsafe_code)]

mod machine;
mod packet;
mod wire;

pub use self::machine::{
    AuthProvider, CipherId, CipherStream, Error, Session, SessionEvent, MAX_MESSAGE,
};
pub use self::packet::{EncAck, EncInit};
