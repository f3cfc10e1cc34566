use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    error::Error,
    msg::{Message, MsgType},
};

/// Default cap on a single message's payload length (§4.1).
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 10 * 1024 * 1024;

/// Writes one framed control message: a one-byte type tag, an eight-byte
/// big-endian length, then the JSON payload.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let payload = msg.encode_payload()?;

    writer.write_u8(msg.msg_type().tag()).await?;
    writer.write_u64(payload.len() as u64).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;

    Ok(())
}

/// Reads one framed control message, enforcing `max_size` against the
/// declared length before any payload bytes are read.
pub async fn read_message<R>(reader: &mut R, max_size: u64) -> Result<Message, Error>
where
    R: AsyncRead + Unpin,
{
    let tag = reader.read_u8().await?;
    let kind = MsgType::from_tag(tag).ok_or(Error::UnknownMessage(tag))?;

    let len = reader.read_u64().await?;
    if len > max_size {
        return Err(Error::MessageTooLarge { len, max: max_size });
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;

    Ok(Message::decode_payload(kind, &payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::Ping;

    #[tokio::test]
    async fn round_trips_a_message() {
        let mut buf = Vec::new();
        let msg = Message::Ping(Ping { timestamp: 42 });
        write_message(&mut buf, &msg).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_message(&mut cursor, DEFAULT_MAX_MESSAGE_SIZE)
            .await
            .unwrap();

        match decoded {
            Message::Ping(p) => assert_eq!(p.timestamp, 42),
            _ => panic!("wrong message type"),
        }
    }

    #[tokio::test]
    async fn rejects_oversized_declared_length() {
        // type tag 0x01 (Login) with a declared length far beyond the cap.
        let bytes = [0x01u8, 0, 0, 0, 0, 0, 0, 0, 0xff];
        let mut cursor = std::io::Cursor::new(bytes);
        let err = read_message(&mut cursor, 16).await.unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { .. }));
    }

    #[tokio::test]
    async fn rejects_unknown_type_tag() {
        let bytes = [0xee_u8, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut cursor = std::io::Cursor::new(bytes);
        let err = read_message(&mut cursor, DEFAULT_MAX_MESSAGE_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownMessage(0xee)));
    }
}
