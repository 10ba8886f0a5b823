//! The channels weir uses to move messages between the coordinator, the
//! workers, and along data-plane edges.
//!
//! A channel is either local (an in-process mpsc queue) or a TCP connection
//! carrying length-prefixed bincode frames. Both ends of every channel
//! preserve FIFO order, which is what lets control markers ride in-band with
//! records.

use std::sync::mpsc;

pub mod tcp;

pub use self::tcp::{TcpReceiver, TcpSender};

/// Errors raised when sending on a channel.
#[derive(Debug, Fail)]
pub enum SendError {
    #[fail(display = "{}", _0)]
    SerializationError(#[cause] bincode::Error),
    #[fail(display = "{}", _0)]
    IoError(#[cause] std::io::Error),
    #[fail(display = "receiving end of the channel has disconnected")]
    Disconnected,
    #[fail(display = "channel has previously encountered an error")]
    Poisoned,
}

impl From<bincode::Error> for SendError {
    fn from(e: bincode::Error) -> Self {
        SendError::SerializationError(e)
    }
}

impl From<std::io::Error> for SendError {
    fn from(e: std::io::Error) -> Self {
        SendError::IoError(e)
    }
}

impl<T> From<mpsc::SendError<T>> for SendError {
    fn from(_: mpsc::SendError<T>) -> Self {
        SendError::Disconnected
    }
}

/// Something messages can be sent into, regardless of whether the other end
/// is a thread in this process or a task on another machine.
pub trait Sender {
    type Item;

    fn send(&mut self, t: Self::Item) -> Result<(), SendError>;
}

/// A local, in-process channel endpoint.
#[derive(Debug)]
pub struct ChannelSender<T>(mpsc::Sender<T>);

impl<T> Clone for ChannelSender<T> {
    fn clone(&self) -> Self {
        // derive(Clone) would require T: Clone, which we don't need
        ChannelSender(self.0.clone())
    }
}

impl<T> ChannelSender<T> {
    pub fn from_local(local: mpsc::Sender<T>) -> Self {
        ChannelSender(local)
    }
}

impl<T> Sender for ChannelSender<T> {
    type Item = T;

    fn send(&mut self, t: T) -> Result<(), SendError> {
        self.0.send(t)?;
        Ok(())
    }
}

impl<T: serde::Serialize> Sender for TcpSender<T> {
    type Item = T;

    fn send(&mut self, t: T) -> Result<(), SendError> {
        TcpSender::send(self, t)
    }
}
