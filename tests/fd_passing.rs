//! File descriptor passing over unix sockets.

mod common;

use std::cell::RefCell;
use std::io::{Read as _, Seek as _, Write as _};
use std::os::unix::io::AsFd;
use std::rc::Rc;
use std::time::Duration;

use pomp::{Addr, Context, Error, Event, EventLoop, PeerCred, Value};

#[test]
fn fd_crosses_a_unix_stream() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();
    let addr: Addr = format!("unix:{}/pomp.sock", dir.path().display()).parse().unwrap();

    let evloop = EventLoop::new().unwrap();
    let received = Rc::new(RefCell::new(Vec::<String>::new()));
    let creds = Rc::new(RefCell::new(Vec::<Option<PeerCred>>::new()));

    let server = Context::with_loop(
        {
            let received = received.clone();
            let creds = creds.clone();
            move |_ctx, event, conn, msg| match event {
                Event::Connected => creds.borrow_mut().push(conn.peer_cred()),
                Event::Msg => {
                    let msg = msg.unwrap();
                    let mut dec = msg.decoder().unwrap();
                    let fd = dec.read_fd().unwrap();
                    // borrowed from the message: duplicate to keep it
                    let dup = fd.try_clone_to_owned().unwrap();
                    let mut file = std::fs::File::from(dup);
                    let mut content = String::new();
                    file.read_to_string(&mut content).unwrap();
                    received.borrow_mut().push(content);
                }
                Event::Disconnected => {}
            }
        },
        evloop.clone(),
    )
    .unwrap();
    server.listen(&addr).unwrap();

    let mut payload = tempfile::tempfile().unwrap();
    payload.write_all(b"fd payload").unwrap();
    payload.rewind().unwrap();

    let client = Context::with_loop(
        {
            move |ctx, event, _conn, _msg| {
                if event == Event::Connected {
                    let conn = ctx.connection().unwrap();
                    conn.send(1, "%x", &[Value::Fd(payload.as_fd())]).unwrap();
                }
            }
        },
        evloop,
    )
    .unwrap();
    client.connect(&addr).unwrap();

    assert!(common::pump_until(
        &[&server],
        Duration::from_secs(5),
        || !received.borrow().is_empty()
    ));
    assert_eq!(received.borrow()[0], "fd payload");

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let creds = creds.borrow();
        let cred = creds[0].expect("unix stream peer should have credentials");
        assert_eq!(cred.pid, std::process::id() as i32);
        assert_eq!(cred.uid, unsafe { libc::getuid() });
    }

    client.stop().unwrap();
    server.stop().unwrap();
}

#[test]
fn fd_refused_on_inet_transport() {
    common::init_logging();
    let evloop = EventLoop::new().unwrap();

    let server = Context::with_loop(|_, _, _, _| {}, evloop.clone()).unwrap();
    server.listen(&"inet:127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = server.local_addr().unwrap();

    let outcome = Rc::new(RefCell::new(None::<pomp::Result<()>>));
    let client = Context::with_loop(
        {
            let outcome = outcome.clone();
            move |ctx, event, _conn, _msg| {
                if event == Event::Connected {
                    let file = tempfile::tempfile().unwrap();
                    let res = ctx.send(1, "%x", &[Value::Fd(file.as_fd())]);
                    *outcome.borrow_mut() = Some(res);
                }
            }
        },
        evloop,
    )
    .unwrap();
    client.connect(&addr).unwrap();

    assert!(common::pump_until(
        &[&server],
        Duration::from_secs(5),
        || outcome.borrow().is_some()
    ));
    assert!(matches!(
        outcome.borrow_mut().take().unwrap(),
        Err(Error::FdPassingNotSupported)
    ));

    client.stop().unwrap();
    server.stop().unwrap();
}

#[cfg(any(target_os = "linux", target_os = "android"))]
#[test]
fn abstract_namespace_round_trip() {
    common::init_logging();
    let addr: Addr = format!("unix:@pomp-test-{}", std::process::id()).parse().unwrap();

    let evloop = EventLoop::new().unwrap();
    let got = Rc::new(RefCell::new(Vec::<String>::new()));
    let server = Context::with_loop(
        {
            let got = got.clone();
            move |_ctx, event, _conn, msg| {
                if event == Event::Msg {
                    got.borrow_mut().push(msg.unwrap().dump().unwrap());
                }
            }
        },
        evloop.clone(),
    )
    .unwrap();
    server.listen(&addr).unwrap();

    let client = Context::with_loop(
        move |ctx, event, _conn, _msg| {
            if event == Event::Connected {
                ctx.send(3, "%s", &[Value::Str("abstract")]).unwrap();
            }
        },
        evloop,
    )
    .unwrap();
    client.connect(&addr).unwrap();

    assert!(common::pump_until(&[&server], Duration::from_secs(5), || !got.borrow().is_empty()));
    assert_eq!(got.borrow()[0], "id=3 'abstract'");

    client.stop().unwrap();
    server.stop().unwrap();
}
