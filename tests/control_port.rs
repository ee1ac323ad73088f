use gridlink::clients::bind_control_port;
use gridlink::runtime::RuntimeEvent;
use gridlink_core::{ClientHub, ClientKind, Emission};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

async fn next_event(rx: &mut mpsc::UnboundedReceiver<RuntimeEvent>) -> RuntimeEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_control_port_lines_and_replies() {
    let hub = Arc::new(ClientHub::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let addr = bind_control_port(0, hub.clone(), tx).await.unwrap();

    let stream = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader).lines();

    let id = match next_event(&mut rx).await {
        RuntimeEvent::ClientJoined(id) => id,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(hub.count(ClientKind::Net), 1);

    writer.write_all(b"*status\r\nG28\n").await.unwrap();
    for expected in ["*status", "G28"] {
        match next_event(&mut rx).await {
            RuntimeEvent::ClientLine { id: from, line } => {
                assert_eq!(from, Some(id));
                assert_eq!(line, expected);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    hub.publish(Emission::event("hello").to(Some(id)));
    let reply = timeout(Duration::from_secs(5), reader.next_line())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.as_deref(), Some("*** hello ***"));

    drop(writer);
    drop(reader);
    match next_event(&mut rx).await {
        RuntimeEvent::ClientLeft(left) => assert_eq!(left, id),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(hub.count(ClientKind::Net), 0);
}

#[tokio::test]
async fn test_control_port_upload() {
    let hub = Arc::new(ClientHub::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let addr = bind_control_port(0, hub, tx).await.unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
    assert!(matches!(next_event(&mut rx).await, RuntimeEvent::ClientJoined(_)));

    stream
        .write_all(b"*upload cube.gcode\nG28\nG1 X10 Y10\n")
        .await
        .unwrap();
    stream.shutdown().await.unwrap();
    drop(stream);

    match next_event(&mut rx).await {
        RuntimeEvent::Upload { name, data } => {
            assert_eq!(name, "cube.gcode");
            assert_eq!(data, b"G28\nG1 X10 Y10\n");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(next_event(&mut rx).await, RuntimeEvent::ClientLeft(_)));
}
