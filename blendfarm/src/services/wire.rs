use crate::models::error::FarmError;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

// blend files travel in a single frame.
pub const MAX_FRAME_LENGTH: usize = 2 * 1024 * 1024 * 1024 - 1;

pub type Connection = Framed<TcpStream, LengthDelimitedCodec>;

pub fn framed(stream: TcpStream) -> Connection {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_framed(stream)
}

pub async fn send<T: Serialize>(conn: &mut Connection, message: &T) -> Result<(), FarmError> {
    let data = bincode::serialize(message)?;
    conn.send(Bytes::from(data)).await?;
    Ok(())
}

/// Next message, or `None` once the peer closed the connection.
pub async fn recv<T: DeserializeOwned>(conn: &mut Connection) -> Result<Option<T>, FarmError> {
    match conn.next().await {
        Some(frame) => Ok(Some(bincode::deserialize(&frame?)?)),
        None => Ok(None),
    }
}
