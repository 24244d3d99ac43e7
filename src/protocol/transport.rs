use std::{
    io::{self, Read, Write},
    net::TcpStream,
    sync::Arc,
};

use log::trace;

use crate::data::{CLIENT_PROTOCOL_VERSION, ServerBlock};

use super::{
    Direction, Message, MessageKind, ProtocolContext, ProtocolError,
    codec::{
        Decoder, Encoder, MAX_ELEMENTS, Wire, WireConfig, decode_list, decode_structure, encode_list,
        encode_structure, wire_config,
    },
    record::{RecordReader, RecordWriter},
    structured::{OpaquePassthrough, StructuredCodec},
};

/// Record-framed message stream over a reader and writer pair.
pub struct ProtocolTransport<R: Read, W: Write> {
    reader: RecordReader<R>,
    writer: RecordWriter<W>,
    config: WireConfig,
    context: ProtocolContext,
    structures: Arc<dyn StructuredCodec>,
}

pub type TcpTransport = ProtocolTransport<TcpStream, TcpStream>;

impl ProtocolTransport<TcpStream, TcpStream> {
    pub fn from_stream(stream: &TcpStream) -> io::Result<Self> {
        Ok(Self::new(stream.try_clone()?, stream.try_clone()?))
    }
}

impl<R: Read, W: Write> ProtocolTransport<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: RecordReader::new(reader),
            writer: RecordWriter::new(writer),
            config: wire_config(),
            context: ProtocolContext::new(CLIENT_PROTOCOL_VERSION),
            structures: Arc::new(OpaquePassthrough),
        }
    }

    pub fn context(&self) -> &ProtocolContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ProtocolContext {
        &mut self.context
    }

    pub fn version(&self) -> u32 {
        self.context.version
    }

    pub fn set_structured_codec(&mut self, structures: Arc<dyn StructuredCodec>) {
        self.structures = structures;
    }

    /// Move `message` across the wire in `direction`.
    ///
    /// On [`Direction::Receive`] the message is replaced by one of the same kind read from
    /// the stream. [`Direction::Free`] empties it without touching the stream.
    pub fn transcode(
        &mut self,
        message: &mut Message,
        direction: Direction,
    ) -> Result<(), ProtocolError> {
        match direction {
            Direction::Send => self.send(message),
            Direction::Receive => {
                *message = self.receive(message.kind())?;
                Ok(())
            }
            Direction::Free => {
                *message = Message::empty(message.kind());
                Ok(())
            }
        }
    }

    pub fn send(&mut self, message: &Message) -> Result<(), ProtocolError> {
        trace!("send {:?} at version {}", message.kind(), self.context.version);
        let mut e = Encoder::new(
            &mut self.writer,
            self.config,
            self.context.version,
            &*self.structures,
        );

        match message {
            Message::RequestBlock(requests) => encode_list(&mut e, "request", requests)?,
            Message::ClientBlock(block) => block.encode(&mut e)?,
            Message::ServerBlock(block) => block.encode(&mut e)?,
            Message::DataBlockList(blocks) => encode_list(&mut e, "data block", blocks)?,
            Message::PutDataBlockList(blocks) => {
                e.put(&(blocks.len() as u32))?;
                blocks.iter().try_for_each(|b| b.encode(&mut e))?;
            }
            Message::NextProtocol(token) => e.put(token)?,
            Message::DataSystem(m) => e.put(m)?,
            Message::SystemConfig(m) => e.put(m)?,
            Message::DataSource(m) => e.put(m)?,
            Message::Signal(m) => e.put(m)?,
            Message::SignalDesc(m) => e.put(m)?,
            Message::DataObject(object) => object.encode(&mut e)?,
            Message::Structure(opaque_type, payload) => {
                encode_structure(&mut e, *opaque_type, payload)?
            }
        }

        if let Message::NextProtocol(_) = message {
            self.writer.end_record()?;
        }
        Ok(())
    }

    pub fn receive(&mut self, kind: MessageKind) -> Result<Message, ProtocolError> {
        trace!("receive {kind:?} at version {}", self.context.version);
        if kind == MessageKind::NextProtocol {
            self.reader.skip_record()?;
        }

        let mut d = Decoder::new(
            &mut self.reader,
            self.config,
            self.context.version,
            &*self.structures,
        );

        let message = match kind {
            MessageKind::RequestBlock => Message::RequestBlock(decode_list(&mut d, "request")?),
            MessageKind::ClientBlock => Message::ClientBlock(Wire::decode(&mut d)?),
            MessageKind::ServerBlock => {
                let block: ServerBlock = Wire::decode(&mut d)?;
                self.context.observe_server(block.version)?;
                Message::ServerBlock(block)
            }
            MessageKind::DataBlockList => {
                Message::DataBlockList(decode_list(&mut d, "data block")?)
            }
            MessageKind::PutDataBlockList => {
                let count: u32 = d.get()?;
                if count as u64 > MAX_ELEMENTS {
                    return Err(ProtocolError::AllocationTooLarge {
                        what: "put block list",
                        count: count as u64,
                        limit: MAX_ELEMENTS,
                    });
                }
                let blocks = (0..count)
                    .map(|_| Wire::decode(&mut d))
                    .collect::<Result<Vec<_>, _>>()?;
                Message::PutDataBlockList(blocks)
            }
            MessageKind::NextProtocol => Message::NextProtocol(d.get()?),
            MessageKind::DataSystem => Message::DataSystem(d.get()?),
            MessageKind::SystemConfig => Message::SystemConfig(d.get()?),
            MessageKind::DataSource => Message::DataSource(d.get()?),
            MessageKind::Signal => Message::Signal(d.get()?),
            MessageKind::SignalDesc => Message::SignalDesc(d.get()?),
            MessageKind::DataObject => Message::DataObject(Wire::decode(&mut d)?),
            MessageKind::Structure(opaque_type) => {
                Message::Structure(opaque_type, decode_structure(&mut d, opaque_type)?)
            }
        };
        Ok(message)
    }

    /// Send everything written since the last boundary as one record.
    pub fn end_record(&mut self) -> Result<(), ProtocolError> {
        self.writer.end_record()?;
        Ok(())
    }

    /// Discard the rest of the incoming record and position at the next one.
    pub fn skip_record(&mut self) -> Result<usize, ProtocolError> {
        Ok(self.reader.skip_record()?)
    }

    /// End the outgoing record and move to the reply.
    pub fn flush(&mut self) -> Result<(), ProtocolError> {
        self.end_record()?;
        self.skip_record()?;
        Ok(())
    }

    /// Drop unread bytes of a record already in progress.
    pub fn discard_pending(&mut self) -> Result<usize, ProtocolError> {
        Ok(self.reader.discard_current()?)
    }

    /// Give up on the message in flight: unsent bytes are dropped and the unread rest of
    /// the incoming record is consumed, so the next exchange starts on a record boundary.
    pub fn abandon_message(&mut self) -> Result<usize, ProtocolError> {
        let unsent = self.writer.discard();
        if unsent > 0 {
            trace!("dropped {unsent} unsent bytes");
        }
        self.discard_pending()
    }

    pub fn is_end_of_record(&self) -> bool {
        self.reader.is_end_of_record()
    }

    pub fn get_ref(&self) -> (&R, &W) {
        (self.reader.get_ref(), self.writer.get_ref())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::data::{
        ClientBlock, DataBlock, DataType, Dim, OpaqueType, PutDataBlock, RequestData,
        RequestDefaults, SignalDesc, Values,
    };

    /// Write with one transport, then read the produced bytes with another.
    fn relay(version: u32, messages: &[Message]) -> ProtocolTransport<Cursor<Vec<u8>>, Vec<u8>> {
        let mut sender = ProtocolTransport::new(Cursor::new(Vec::new()), Vec::new());
        sender.context_mut().version = version;
        for message in messages {
            sender.send(message).unwrap();
        }
        sender.end_record().unwrap();

        let bytes = sender.writer.get_ref().clone();
        let mut receiver = ProtocolTransport::new(Cursor::new(bytes), Vec::new());
        receiver.context_mut().version = version;
        receiver.skip_record().unwrap();
        receiver
    }

    #[test]
    fn request_and_put_lists() {
        let request = RequestData::parse("ip", "12345", &RequestDefaults::default())
            .unwrap()
            .with_put_data(vec![PutDataBlock::new("x", Values::Double(vec![1.0, 2.0]))]);
        let puts = request.put_data.clone();

        let mut receiver = relay(
            8,
            &[
                Message::RequestBlock(vec![request.clone(), request.clone()]),
                Message::PutDataBlockList(puts.clone()),
            ],
        );

        let mut message = Message::empty(MessageKind::RequestBlock);
        receiver.transcode(&mut message, Direction::Receive).unwrap();
        match message {
            Message::RequestBlock(received) => {
                assert_eq!(received.len(), 2);
                assert_eq!(received[1].exp_number, 12345);
                assert!(received[1].put);
            }
            other => panic!("unexpected {other:?}"),
        }

        let message = receiver.receive(MessageKind::PutDataBlockList).unwrap();
        assert_eq!(message, Message::PutDataBlockList(puts));
        assert!(receiver.is_end_of_record());
    }

    #[test]
    fn free_clears_without_io() {
        let mut transport = ProtocolTransport::new(Cursor::new(Vec::new()), Vec::new());
        let mut message = Message::DataBlockList(vec![DataBlock::new(Values::Int(vec![1]))]);

        transport.transcode(&mut message, Direction::Free).unwrap();
        assert_eq!(message, Message::DataBlockList(Vec::new()));
        assert_eq!(transport.writer.pending(), 0);
    }

    #[test]
    fn next_protocol_starts_a_new_record() {
        let mut sender = ProtocolTransport::new(Cursor::new(Vec::new()), Vec::new());
        sender
            .send(&Message::ClientBlock(ClientBlock::default()))
            .unwrap();
        sender.end_record().unwrap();
        sender.send(&Message::NextProtocol(42)).unwrap();
        assert_eq!(sender.writer.pending(), 0);

        let bytes = sender.writer.get_ref().clone();
        let mut receiver = ProtocolTransport::new(Cursor::new(bytes), Vec::new());
        receiver.skip_record().unwrap();

        // The unread client block is skipped on the way to the token.
        assert_eq!(
            receiver.receive(MessageKind::NextProtocol).unwrap(),
            Message::NextProtocol(42)
        );
        assert!(receiver.is_end_of_record());
    }

    #[test]
    fn server_version_is_pinned() {
        let mut receiver = relay(
            8,
            &[
                Message::ServerBlock(ServerBlock::new(8)),
                Message::ServerBlock(ServerBlock::new(9)),
            ],
        );
        receiver.receive(MessageKind::ServerBlock).unwrap();
        assert_eq!(receiver.context().server_version(), Some(8));

        let err = receiver.receive(MessageKind::ServerBlock).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ServerVersionChanged {
                expected: 8,
                found: 9
            }
        ));
    }

    #[test]
    fn data_list_and_metadata() {
        let block = DataBlock::new(Values::Double(vec![3.0; 10]))
            .with_dim(Dim::new(Values::Float((0..10).map(|i| i as f32 * 0.5).collect())));
        let desc = SignalDesc {
            signal_name: "ip".to_string(),
            rank: 1,
            ..SignalDesc::default()
        };
        let mut receiver = relay(
            8,
            &[
                Message::SignalDesc(desc.clone()),
                Message::DataBlockList(vec![block.clone()]),
                Message::Structure(OpaqueType::Structures, b"tree".to_vec()),
            ],
        );

        assert_eq!(
            receiver.receive(MessageKind::SignalDesc).unwrap(),
            Message::SignalDesc(desc)
        );
        match receiver.receive(MessageKind::DataBlockList).unwrap() {
            Message::DataBlockList(blocks) => {
                assert_eq!(blocks.len(), 1);
                assert_eq!(blocks[0].data, block.data);
                assert_eq!(blocks[0].dims[0].data_type, DataType::Float);
                assert_eq!(blocks[0].dims[0].values, block.dims[0].values);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            receiver
                .receive(MessageKind::Structure(OpaqueType::Structures))
                .unwrap(),
            Message::Structure(OpaqueType::Structures, b"tree".to_vec())
        );
    }
}
