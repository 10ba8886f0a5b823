//! Synchronous TCP channels carrying length-prefixed bincode frames.
//!
//! Every frame is a `u32` length in network byte order followed by the
//! bincode encoding of the message. The format is the same in both
//! directions, so the two endpoint types here compose into a full duplex
//! channel when given both halves of a connection.

use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::net::{SocketAddr, TcpStream};

use bufstream::BufStream;
use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::SendError;

macro_rules! poisoning_try {
    ($self_:ident, $e:expr) => {
        match $e {
            Ok(v) => v,
            Err(r) => {
                $self_.poisoned = true;
                return Err(r.into());
            }
        }
    };
}

/// The sending half of a TCP channel.
pub struct TcpSender<T> {
    stream: BufStream<TcpStream>,
    poisoned: bool,

    phantom: PhantomData<T>,
}

impl<T: Serialize> TcpSender<T> {
    pub fn new(stream: TcpStream) -> Result<Self, io::Error> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream: BufStream::new(stream),
            poisoned: false,
            phantom: PhantomData,
        })
    }

    pub fn connect(addr: &SocketAddr) -> Result<Self, io::Error> {
        Self::new(TcpStream::connect(addr)?)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.get_ref().local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.get_ref().peer_addr()
    }

    /// Send a message on this channel. Ownership isn't actually required, but
    /// is taken anyway to conform to the same api as `mpsc::Sender`.
    pub fn send(&mut self, t: T) -> Result<(), SendError> {
        self.send_ref(&t)
    }

    pub fn send_ref(&mut self, t: &T) -> Result<(), SendError> {
        if self.poisoned {
            return Err(SendError::Poisoned);
        }

        let size = bincode::serialized_size(t)? as u32;
        poisoning_try!(self, self.stream.write_u32::<NetworkEndian>(size));
        poisoning_try!(self, bincode::serialize_into(&mut self.stream, t));
        poisoning_try!(self, self.stream.flush());
        Ok(())
    }
}

/// Errors raised when receiving from a TCP channel.
#[derive(Debug, Fail)]
pub enum RecvError {
    #[fail(display = "{}", _0)]
    IoError(#[cause] io::Error),
    #[fail(display = "{}", _0)]
    DeserializationError(#[cause] bincode::Error),
    #[fail(display = "sending end of the channel has disconnected")]
    Disconnected,
}

impl From<io::Error> for RecvError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            RecvError::Disconnected
        } else {
            RecvError::IoError(e)
        }
    }
}

/// The receiving half of a TCP channel.
pub struct TcpReceiver<T> {
    stream: io::BufReader<TcpStream>,

    phantom: PhantomData<T>,
}

impl<T: DeserializeOwned> TcpReceiver<T> {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: io::BufReader::new(stream),
            phantom: PhantomData,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.get_ref().local_addr()
    }

    /// Block until the next frame arrives.
    pub fn recv(&mut self) -> Result<T, RecvError> {
        let size = self.stream.read_u32::<NetworkEndian>()?;
        let mut frame = (&mut self.stream).take(u64::from(size));
        bincode::deserialize_from(&mut frame).map_err(RecvError::DeserializationError)
    }
}
