use std::{io::Cursor, sync::{Arc, mpsc}, time::Duration};

use peerchain::{
    channel::{ChannelManager, ChannelManagerSettings, OpenFlags, PeerDirectory, PeerInfo, memory::MemoryTransport},
    dispatch::Dispatcher,
    streams::{BufferReceiver, ProcessContext, ProcessStreamsListener, StreamKind},
};

const PROCESSES: &str = "Processes";

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn a_process_session_pumps_all_three_streams() {
    let transport = MemoryTransport::new();
    let manager = ChannelManager::new(
        Dispatcher::start("streams-test").unwrap(),
        Arc::new(transport.clone()),
        Arc::new(PeerDirectory::new()),
        ChannelManagerSettings::default(),
    );
    let channel = manager.open_channel(&PeerInfo::new("agent"), OpenFlags::default()).await.unwrap();
    let streams = transport.streams_for("agent");

    let stdout = BufferReceiver::new(&[StreamKind::Stdout]);
    let both = BufferReceiver::new(&[StreamKind::Stdout, StreamKind::Stderr]);
    let listener = ProcessStreamsListener::new(manager.clone(), channel.clone(), PROCESSES);
    listener.register_receiver(stdout.clone());
    listener.register_receiver(both.clone());
    listener.set_data_provider(Box::new(Cursor::new(b"run\nquit\n".to_vec())));
    manager.subscribe_stream(&channel, PROCESSES, listener.clone()).await.unwrap();
    listener.set_process_context(ProcessContext {
        id: "p-42".into(),
        stdin_id: Some("p-42-in".into()),
        stdout_id: Some("p-42-out".into()),
        stderr_id: Some("p-42-err".into()),
    });

    streams.create_stream(PROCESSES, "p-42-in", Some("p-42"));
    streams.create_stream(PROCESSES, "p-42-out", Some("p-42"));
    streams.create_stream(PROCESSES, "p-42-err", Some("p-42"));

    streams.push_chunk("p-42-out", b"ok\n");
    streams.push_chunk("p-42-err", b"warning\n");
    assert!(eventually(|| streams.eos_received("p-42-in")).await);
    assert_eq!(streams.written("p-42-in"), b"run\nquit\n");

    let (tx, rx) = mpsc::channel();
    listener.dispose_on_eof(Some(Box::new(move || tx.send(()).unwrap())));
    streams.push_eos("p-42-out");
    streams.push_eos("p-42-err");
    assert!(eventually(|| rx.try_recv().is_ok()).await);

    assert_eq!(stdout.text(), "ok\n");
    assert!(both.text().contains("ok\n") && both.text().contains("warning\n"));
    assert!(stdout.is_closed() && both.is_closed());
    for id in ["p-42-in", "p-42-out", "p-42-err"] {
        assert_eq!(streams.disconnect_count(id), 1, "{id}");
    }
    assert_eq!(streams.subscriber_count(PROCESSES), 0);

    manager.close_channel(&channel).await.unwrap();
}
