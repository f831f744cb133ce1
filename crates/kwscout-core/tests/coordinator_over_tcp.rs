use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kwscout_core::client::{watch_events, TcpTransport};
use kwscout_core::coordinator::Coordinator;
use kwscout_core::ipc::{Command, ErrorKind, Event, Reason, Reply, TabId};
use kwscout_core::keyword::MatchType;
use kwscout_core::page::{PageSession, TextSourcePage};
use kwscout_core::retry::{ClientError, Messenger, RetryPolicy};
use kwscout_core::server::{serve, ServerConfig};
use kwscout_core::store::{JsonFileStore, KvStore, MemoryStore};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use uuid::Uuid;

struct CleanupDir(PathBuf);

impl Drop for CleanupDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn temp_dir() -> CleanupDir {
    let dir = std::env::temp_dir().join(format!("kwscout-it-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    CleanupDir(dir)
}

/// 在已绑定的端口上启动一个协调器，返回协调器与服务任务句柄。
async fn serve_on(listener: TcpListener, store: Arc<dyn KvStore>) -> (Arc<Coordinator>, JoinHandle<anyhow::Result<()>>) {
    let coordinator = Arc::new(Coordinator::new(store));
    coordinator.activate().await;
    let config = ServerConfig {
        call_timeout: Duration::from_secs(5),
    };
    let handle = tokio::spawn(serve(listener, coordinator.clone(), config));
    (coordinator, handle)
}

async fn start(store: Arc<dyn KvStore>) -> (String, Arc<Coordinator>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (coordinator, _handle) = serve_on(listener, store).await;
    (addr, coordinator)
}

fn messenger(addr: &str) -> Messenger<TcpTransport> {
    Messenger::new(TcpTransport::new(addr), RetryPolicy::default())
}

fn quick_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(500),
        jitter: false,
    }
}

/// 空闲的本地地址（绑定后立即释放）。
fn free_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

async fn wait_for_page(coordinator: &Coordinator, tab_id: TabId) {
    for _ in 0..300 {
        if coordinator.pages().get(tab_id).await.is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("tab {tab_id} never registered");
}

async fn wait_until<F: Fn() -> bool>(check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn add_duplicate_remove_persist_across_restart() {
    let dir = temp_dir();
    let store_file = dir.0.join("store.json");
    let (addr, _c) = start(Arc::new(JsonFileStore::new(&store_file))).await;
    let m = messenger(&addr);

    let pong = m.ping().await.unwrap();
    assert!(matches!(pong.data, Some(Reply::Pong { ready: true, .. })));

    let add = |keyword: &str| Command::AddKeyword {
        keyword: keyword.to_string(),
        metadata: None,
        is_negative: None,
        match_type: None,
    };
    assert!(m.call(add("[running shoes]")).await.unwrap().success);
    let dup = m.call(add("running shoes")).await.unwrap();
    assert!(!dup.success);
    assert_eq!(dup.error_kind(), Some(ErrorKind::Duplicate));
    assert!(matches!(
        dup.data,
        Some(Reply::Added {
            added: false,
            reason: Some(Reason::Duplicate),
            ..
        })
    ));
    assert!(m.call(add("-free")).await.unwrap().success);

    let missing = m
        .call(Command::RemoveKeyword {
            keyword: "boots".to_string(),
            is_negative: None,
        })
        .await
        .unwrap();
    assert_eq!(missing.error_kind(), Some(ErrorKind::NotFound));

    // 新协调器实例读取同一个存储文件。
    let (addr2, _c2) = start(Arc::new(JsonFileStore::new(&store_file))).await;
    let listed = messenger(&addr2).call(Command::LoadKeywords).await.unwrap();
    assert_eq!(
        listed.data,
        Some(Reply::Keywords {
            positive: vec!["[running shoes]".to_string()],
            negative: vec!["free".to_string()],
        })
    );
}

#[tokio::test]
async fn page_session_answers_detect_and_highlight() {
    let dir = temp_dir();
    let source = dir.0.join("page.txt");
    std::fs::write(&source, "running shoes\ntrail shoes\nrunning shoes\n\n").unwrap();
    let (addr, coordinator) = start(Arc::new(MemoryStore::new())).await;

    let page = Arc::new(TextSourcePage::new(&source));
    let session = PageSession::connect(&addr, 7, "https://ads.google.com/aw/keywords", RetryPolicy::default())
        .await
        .unwrap();
    assert_eq!(session.tab_id(), 7);
    let agent = page.clone();
    tokio::spawn(async move { session.run(agent).await });
    wait_for_page(&coordinator, 7).await;

    let m = messenger(&addr);
    let detected = m
        .call(Command::DetectKeywords { tab_id: Some(7) })
        .await
        .unwrap();
    assert_eq!(
        detected.data,
        Some(Reply::Detected {
            tab_id: 7,
            keywords: vec!["running shoes".to_string(), "trail shoes".to_string()],
        })
    );

    let missing_tab = m.call(Command::DetectKeywords { tab_id: None }).await.unwrap();
    assert_eq!(missing_tab.error_kind(), Some(ErrorKind::NoTab));
    let offline = m
        .call(Command::DetectKeywords { tab_id: Some(99) })
        .await
        .unwrap();
    assert_eq!(offline.error_kind(), Some(ErrorKind::Scrape));

    let highlight = m
        .call(Command::BroadcastHighlight {
            keywords: vec!["trail shoes".to_string()],
            on: true,
        })
        .await
        .unwrap();
    assert!(highlight.success);
    assert_eq!(
        highlight.data,
        Some(Reply::Highlight {
            delivered: vec![7],
            failed: Vec::new(),
            suppressed: false,
        })
    );
    assert_eq!(page.highlighted().await, vec!["trail shoes".to_string()]);
}

#[tokio::test]
async fn subscribers_receive_keyword_updates() {
    let (addr, coordinator) = start(Arc::new(MemoryStore::new())).await;

    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let watch_addr = addr.clone();
    tokio::spawn(async move {
        let _ = watch_events(&watch_addr, move |event| tx.try_send(event).is_ok()).await;
    });
    let c = coordinator.clone();
    wait_until(move || c.subscriber_count() > 0).await;

    let m = messenger(&addr);
    let resp = m
        .call(Command::AddKeyword {
            keyword: "shoes".to_string(),
            metadata: None,
            is_negative: Some(true),
            match_type: None,
        })
        .await
        .unwrap();
    assert!(resp.success);

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        Event::KeywordsUpdated {
            positive: Vec::new(),
            negative: vec!["shoes".to_string()],
        }
    );
}

#[tokio::test]
async fn malformed_line_gets_invalid_input_response() {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let (addr, _c) = start(Arc::new(MemoryStore::new())).await;
    let mut stream = tokio::net::TcpStream::connect(&addr).await.unwrap();
    stream.write_all(b"{not json}\n").await.unwrap();
    let mut line = String::new();
    BufReader::new(&mut stream).read_line(&mut line).await.unwrap();
    let frame: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(frame["type"], "response");
    assert_eq!(frame["response"]["success"], false);
    assert_eq!(frame["response"]["error"]["kind"], "invalid_input");
    assert_eq!(frame["response"]["request_id"], Uuid::nil().to_string());
}

#[tokio::test]
async fn call_succeeds_when_coordinator_binds_after_first_failure() {
    let addr = free_addr();

    let single = Messenger::new(TcpTransport::new(&addr), quick_policy(1));
    match single.ping().await {
        Err(ClientError::Communication { attempts: 1, .. }) => {}
        other => panic!("expected the first attempt to fail: {other:?}"),
    }

    let late_addr = addr.clone();
    let late = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let listener = TcpListener::bind(&late_addr).await.unwrap();
        serve_on(listener, Arc::new(MemoryStore::new())).await
    });

    let m = Messenger::new(TcpTransport::new(&addr), quick_policy(8));
    let pong = m.ping().await.unwrap();
    assert!(matches!(pong.data, Some(Reply::Pong { ready: true, .. })));
    let (_coordinator, handle) = late.await.unwrap();
    handle.abort();
}

#[tokio::test]
async fn page_reregisters_after_coordinator_restart() {
    let dir = temp_dir();
    let source = dir.0.join("page.txt");
    std::fs::write(&source, "running shoes\n").unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (first, first_handle) = serve_on(listener, Arc::new(MemoryStore::new())).await;

    let page = Arc::new(TextSourcePage::new(&source));
    let session = PageSession::connect(&addr, 11, "https://ads.google.com/aw/keywords", quick_policy(20))
        .await
        .unwrap();
    let agent = page.clone();
    let running = tokio::spawn(async move { session.run(agent).await });
    wait_for_page(&first, 11).await;

    first_handle.abort();
    let _ = first_handle.await;

    let listener = TcpListener::bind(&addr).await.unwrap();
    let (second, second_handle) = serve_on(listener, Arc::new(MemoryStore::new())).await;
    wait_for_page(&second, 11).await;

    let detected = messenger(&addr)
        .call(Command::DetectKeywords { tab_id: Some(11) })
        .await
        .unwrap();
    assert_eq!(
        detected.data,
        Some(Reply::Detected {
            tab_id: 11,
            keywords: vec!["running shoes".to_string()],
        })
    );
    assert!(!running.is_finished());
    second_handle.abort();
}

#[tokio::test]
async fn page_originated_add_reaches_coordinator_and_returns_update() {
    let dir = temp_dir();
    let source = dir.0.join("page.txt");
    std::fs::write(&source, "Trail Shoes on sale\n").unwrap();
    let (addr, coordinator) = start(Arc::new(MemoryStore::new())).await;

    let page = Arc::new(TextSourcePage::new(&source));
    let session = PageSession::connect(&addr, 5, "https://ads.google.com/aw/keywords", RetryPolicy::default())
        .await
        .unwrap();
    let commands = session.commands();
    let agent = page.clone();
    tokio::spawn(async move { session.run(agent).await });
    wait_for_page(&coordinator, 5).await;

    let resp = commands
        .add_selection(" trail shoes ", MatchType::Exact, page.as_ref())
        .await
        .unwrap();
    assert!(resp.success, "{resp:?}");

    let expected = Event::KeywordsUpdated {
        positive: vec!["[trail shoes]".to_string()],
        negative: Vec::new(),
    };
    let mut seen = None;
    for _ in 0..300 {
        seen = page.last_update().await;
        if seen.as_ref() == Some(&expected) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(seen, Some(expected));
    assert_eq!(page.highlighted().await, vec!["trail shoes".to_string()]);

    let again = commands
        .add_selection("trail shoes", MatchType::Exact, page.as_ref())
        .await
        .unwrap();
    assert_eq!(again.error_kind(), Some(ErrorKind::Duplicate));
}
