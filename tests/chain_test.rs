use std::{sync::Arc, time::Duration};

use peerchain::{
    channel::{
        ChannelError, ChannelEventKind, ChannelManager, ChannelManagerSettings, ChannelState, OpenFlags,
        TransportError, event::drain, memory::MemoryTransport,
    },
    config::ChainConfig,
    dispatch::Dispatcher,
    value_add::{SimulatedValueAdd, ValueAdd},
};

const CHAIN: &str = r#"
peers:
  - id: gateway
    transport: TCP
    host: gw.example.com
    port: 1534
  - id: board
    proxy: gateway
    value_adds: [tracer]
value_adds:
  - id: tracer
    kind: simulated
    base_port: 4000
redirect_delay_ms: 10
"#;

fn manager(config: &ChainConfig, transport: &MemoryTransport) -> ChannelManager {
    let settings = ChannelManagerSettings::default().with_redirect_delay(Duration::from_millis(10));
    ChannelManager::new(
        Dispatcher::start("chain-test").unwrap(),
        Arc::new(transport.clone()),
        Arc::new(config.build_simulated_directory(4000)),
        settings,
    )
}

#[tokio::test]
async fn opens_through_the_proxy_and_the_value_add() {
    let config = ChainConfig::parse(CHAIN).unwrap();
    let transport = MemoryTransport::new();
    let m = manager(&config, &transport);
    let mut events = m.events().subscribe();

    let board = config.peer("board").unwrap();
    let channel = m.open_channel(&board, OpenFlags::default()).await.unwrap();

    assert_eq!(channel.state(), ChannelState::Open);
    assert_eq!(channel.remote_peer().id, "board");
    assert_eq!(transport.opens(), vec!["gateway".to_string()]);
    assert_eq!(
        transport.redirects(),
        vec![
            ("gateway".to_string(), "TCP:127.0.0.1:4000".to_string()),
            ("TCP:127.0.0.1:4000".to_string(), "board".to_string()),
        ]
    );

    let kinds: Vec<ChannelEventKind> = drain(&mut events).into_iter().map(|e| e.kind).collect();
    assert_eq!(kinds.first(), Some(&ChannelEventKind::Opening));
    assert_eq!(kinds.last(), Some(&ChannelEventKind::Open));
    assert_eq!(kinds.iter().filter(|k| **k == ChannelEventKind::Redirect).count(), 2);

    let tracer = m.directory().value_add("tracer").unwrap();
    assert!(tracer.is_alive("board").await.unwrap());

    m.close_channel(&channel).await.unwrap();
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(!tracer.is_alive("board").await.unwrap());
    assert!(drain(&mut events).iter().any(|e| e.kind == ChannelEventKind::Close));
}

#[tokio::test]
async fn a_failed_redirect_rolls_the_whole_chain_back() {
    let config = ChainConfig::parse(CHAIN).unwrap();
    let transport = MemoryTransport::new();
    transport.fail_redirect("board", TransportError::Refused("agent down".into()));
    let m = manager(&config, &transport);

    let err = m
        .open_channel(&config.peer("board").unwrap(), OpenFlags::default())
        .await
        .unwrap_err();
    let ChannelError::Failed { failure, .. } = &err else {
        panic!("unexpected error {err}");
    };
    assert!(failure.rolled_back.contains(&"launch-value-add".to_string()));
    assert!(matches!(failure.status.cause::<ChannelError>(), Some(ChannelError::Redirect { .. })));

    assert!(transport.channels().iter().all(|c| c.state() == ChannelState::Closed));
    assert!(m.get_channel("board").is_none());
    let tracer = m.directory().value_add("tracer").unwrap();
    assert!(!tracer.is_alive("board").await.unwrap());
}

#[tokio::test]
async fn a_helper_started_elsewhere_is_left_running() {
    let transport = MemoryTransport::new();
    let va = SimulatedValueAdd::new("tracer", 4500);
    va.start_externally("board");

    let directory = peerchain::channel::PeerDirectory::new();
    directory.add_value_add(Arc::new(va.clone()));
    directory.add_peer(peerchain::channel::PeerInfo::new("board"), None, vec!["tracer".into()]);
    let m = ChannelManager::new(
        Dispatcher::start("chain-test").unwrap(),
        Arc::new(transport.clone()),
        Arc::new(directory),
        ChannelManagerSettings::default().with_redirect_delay(Duration::from_millis(10)),
    );

    let channel = m
        .open_channel(&peerchain::channel::PeerInfo::new("board"), OpenFlags::default())
        .await
        .unwrap();
    assert_eq!(va.launches(), 0);
    m.close_channel(&channel).await.unwrap();
    assert_eq!(va.shutdowns(), 0);
    assert!(va.peer("board").is_some());
}

#[cfg(unix)]
#[tokio::test]
async fn external_value_adds_from_the_chain_file_are_launched() {
    let config = ChainConfig::parse(
        r##"
peers:
  - id: board
    value_adds: [relay]
value_adds:
  - id: relay
    kind: external
    program: sh
    args: ["-c", "echo 'Server-Properties: {\"TransportName\":\"TCP\",\"Port\":\"7001\"}'; cat > /dev/null"]
    output_timeout_ms: 5000
"##,
    )
    .unwrap();
    let transport = MemoryTransport::new();
    let probe: Arc<dyn peerchain::channel::Transport> = Arc::new(transport.clone());
    let directory = Arc::new(config.build_directory(Some(probe)));
    let m = ChannelManager::new(
        Dispatcher::start("external-chain-test").unwrap(),
        Arc::new(transport.clone()),
        directory.clone(),
        ChannelManagerSettings::default().with_redirect_delay(Duration::from_millis(10)),
    );

    let channel = m.open_channel(&config.peer("board").unwrap(), OpenFlags::default()).await.unwrap();
    assert_eq!(channel.remote_peer().id, "board");
    assert_eq!(transport.opens(), vec!["TCP:127.0.0.1:7001".to_string()]);
    assert_eq!(transport.redirects(), vec![("TCP:127.0.0.1:7001".to_string(), "board".to_string())]);

    let relay = directory.value_add("relay").unwrap();
    assert!(relay.peer("board").is_some());

    m.close_channel(&channel).await.unwrap();
    assert!(relay.peer("board").is_none());
}
