use chirpdrop_core::transfer::encode_utf16;
use chirpdrop_core::{
    DataChannel, FileReceiver, FileSender, ReceiveEvent, ReceivedFile, Result,
    SendStep, SignalingError, CHUNK_SIZE, MAX_BUFFERED_AMOUNT,
};
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::io::Cursor;

/// In-memory channel: messages queue up until the test drains them
#[derive(Default)]
struct LoopbackChannel {
    queue: VecDeque<Vec<u8>>,
    sends: usize,
    extra_buffered: usize,
    closed: bool,
}

impl LoopbackChannel {
    fn drain_into(&mut self, receiver: &mut FileReceiver) -> Vec<ReceiveEvent> {
        self.queue
            .drain(..)
            .map(|message| receiver.on_message(&message).unwrap())
            .collect()
    }
}

impl DataChannel for LoopbackChannel {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(SignalingError::ChannelClosed);
        }
        self.sends += 1;
        self.queue.push_back(data.to_vec());
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        self.queue.iter().map(Vec::len).sum::<usize>() + self.extra_buffered
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

fn random_file(len: usize) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    (0..len).map(|_| rng.gen()).collect()
}

#[test]
fn test_50000_byte_transfer() {
    let data = random_file(50_000);
    let mut channel = LoopbackChannel::default();
    let mut sender = FileSender::new("photo.jpg", 50_000, Cursor::new(data.clone())).unwrap();
    let mut receiver = FileReceiver::new(0);

    sender.start(&mut channel).unwrap();
    let header = channel.drain_into(&mut receiver);
    assert_eq!(
        header,
        vec![
            ReceiveEvent::Name("photo.jpg".to_string()),
            ReceiveEvent::SizeAnnounced(50_000),
        ]
    );

    let headers_sent = channel.sends;
    let mut steps = Vec::new();
    loop {
        let step = sender.poll_send(&mut channel).unwrap();
        steps.push(step);
        if let SendStep::Complete { .. } = step {
            break;
        }
    }

    assert_eq!(channel.sends - headers_sent, 4);
    let sizes: Vec<usize> = channel.queue.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![CHUNK_SIZE, CHUNK_SIZE, CHUNK_SIZE, 916]);
    assert_eq!(
        steps.last(),
        Some(&SendStep::Complete { bytes_sent: 50_000 })
    );

    let events = channel.drain_into(&mut receiver);
    assert_eq!(
        &events[..3],
        &[
            ReceiveEvent::Chunk { received: 16_384 },
            ReceiveEvent::Chunk { received: 32_768 },
            ReceiveEvent::Chunk { received: 49_152 },
        ]
    );
    match &events[3] {
        ReceiveEvent::Complete(ReceivedFile { name, data: received }) => {
            assert_eq!(name, "photo.jpg");
            assert_eq!(received, &data);
        }
        other => panic!("Expected Complete, got {:?}", other),
    }
    assert_eq!(receiver.received(), 50_000);
    assert!(receiver.is_complete());

    // The sender tore its channel down with the last chunk
    assert!(channel.closed);
    assert!(matches!(
        channel.send(b"late"),
        Err(SignalingError::ChannelClosed)
    ));
    assert!(receiver.on_message(b"late").is_err());
}

#[test]
fn test_sender_waits_for_buffer_to_drain() {
    let data = random_file(CHUNK_SIZE * 3);
    let mut channel = LoopbackChannel {
        extra_buffered: MAX_BUFFERED_AMOUNT,
        ..Default::default()
    };
    let mut sender = FileSender::new("f.bin", data.len() as u64, Cursor::new(data)).unwrap();
    let mut receiver = FileReceiver::new(0);
    sender.start(&mut channel).unwrap();

    // Header messages alone push the buffer past the limit
    assert!(matches!(
        sender.poll_send(&mut channel).unwrap(),
        SendStep::Deferred { .. }
    ));
    assert_eq!(sender.bytes_sent(), 0);

    channel.drain_into(&mut receiver);
    assert_eq!(
        sender.poll_send(&mut channel).unwrap(),
        SendStep::Sent {
            bytes_sent: CHUNK_SIZE as u64
        }
    );
    assert!(matches!(
        sender.poll_send(&mut channel).unwrap(),
        SendStep::Deferred { .. }
    ));

    channel.extra_buffered = 0;
    let mut completed = false;
    for _ in 0..3 {
        if let SendStep::Complete { .. } = sender.poll_send(&mut channel).unwrap() {
            completed = true;
            break;
        }
    }
    assert!(completed);
    assert!(channel.closed);

    // Receiving end closes its side once the last chunk lands
    let mut incoming = LoopbackChannel::default();
    let messages: Vec<Vec<u8>> = channel.queue.drain(..).collect();
    let mut last = None;
    for message in &messages {
        assert!(!incoming.closed);
        last = Some(receiver.receive(&mut incoming, message).unwrap());
    }
    assert!(matches!(last, Some(ReceiveEvent::Complete(_))));
    assert!(incoming.closed);
}

#[test]
fn test_bitrate_telemetry() {
    let mut receiver = FileReceiver::new(1_000);
    receiver.on_message(&encode_utf16("x")).unwrap();
    receiver.on_message(&encode_utf16("200000")).unwrap();

    receiver.on_message(&vec![0u8; 62_500]).unwrap();
    // 62500 bytes in 500 ms
    assert_eq!(receiver.sample_bitrate(1_500), Some(1_000));

    receiver.on_message(&vec![0u8; 31_250]).unwrap();
    assert_eq!(receiver.sample_bitrate(2_000), Some(500));

    let summary = receiver.summary(2_000);
    assert_eq!(summary.bytes, 93_750);
    assert_eq!(summary.max_kbps, 1_000);
    assert_eq!(summary.average_kbps, 750);
}
