use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mongocore::auth::Authenticator;
use mongocore::connstring::Host;
use mongocore::error::Error;
use mongocore::options::ClientOptions;
use mongocore::pool::ConnectionPool;
use mongocore::stream::StreamConnector;
use mongocore::wire_protocol::buffer::BufferPool;

// A listener that accepts and parks connections so pooled sockets stay open.
fn acceptor() -> Host {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    thread::spawn(move || {
        let mut parked = Vec::new();
        while let Ok((stream, _)) = listener.accept() {
            parked.push(stream);
        }
    });

    Host::new("127.0.0.1".to_owned(), port)
}

fn pool_with(host: Host, options: ClientOptions) -> ConnectionPool {
    ConnectionPool::new(
        host,
        StreamConnector::new(Some(Duration::from_secs(5)), false),
        Authenticator::default(),
        Vec::new(),
        Arc::new(BufferPool::new()),
        Arc::new(options),
    )
}

#[test]
fn wait_queue_full_rejects_immediately() {
    let mut options = ClientOptions::default();
    options.max_pool_size = 2;
    options.max_wait_queue_size = 0;
    options.max_wait_time = Duration::from_millis(0);

    let pool = pool_with(acceptor(), options);

    let _first = pool.check_out().unwrap();
    let _second = pool.check_out().unwrap();

    match pool.check_out() {
        Err(Error::WaitQueueFull(_)) => (),
        other => panic!("expected WaitQueueFull, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn saturated_pool_times_out_after_max_wait() {
    let mut options = ClientOptions::default();
    options.max_pool_size = 1;
    options.max_wait_time = Duration::from_millis(100);

    let pool = pool_with(acceptor(), options);
    let _held = pool.check_out().unwrap();

    let start = Instant::now();
    match pool.check_out() {
        Err(Error::WaitQueueTimeout(_)) => (),
        other => panic!("expected WaitQueueTimeout, got {:?}", other.map(|_| ())),
    }
    assert!(start.elapsed() >= Duration::from_millis(100));
}

#[test]
fn checked_in_connections_are_reused() {
    let mut options = ClientOptions::default();
    options.max_pool_size = 4;
    let pool = pool_with(acceptor(), options);

    let id = {
        let conn = pool.check_out().unwrap();
        conn.id
    };

    // LIFO reuse hands the warm socket back.
    let conn = pool.check_out().unwrap();
    assert_eq!(id, conn.id);
    assert_eq!((1, 0, 0), {
        drop(conn);
        let (total, _, waiters) = pool.stats();
        (total, 0, waiters)
    });
}

#[test]
fn waiter_wakes_when_a_connection_returns() {
    let mut options = ClientOptions::default();
    options.max_pool_size = 1;
    options.max_wait_time = Duration::from_secs(5);

    let pool = pool_with(acceptor(), options);
    let held = pool.check_out().unwrap();

    let contender = pool.clone();
    let waiter = thread::spawn(move || contender.check_out().map(|conn| conn.id));

    thread::sleep(Duration::from_millis(50));
    let held_id = held.id;
    drop(held);

    let acquired = waiter.join().unwrap().unwrap();
    assert_eq!(held_id, acquired);
}

#[test]
fn pool_never_exceeds_max_size() {
    let mut options = ClientOptions::default();
    options.max_pool_size = 3;
    options.max_wait_time = Duration::from_secs(5);

    let pool = pool_with(acceptor(), options);

    let mut workers = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        workers.push(thread::spawn(move || {
            for _ in 0..20 {
                let conn = pool.check_out().unwrap();
                let (total, _, _) = pool.stats();
                assert!(total <= 3, "pool grew to {}", total);
                drop(conn);
            }
        }));
    }

    for worker in workers {
        worker.join().unwrap();
    }

    let (total, available, waiters) = pool.stats();
    assert!(total <= 3);
    assert_eq!(total, available);
    assert_eq!(0, waiters);
}

#[test]
fn request_ids_increase_within_a_connection() {
    let pool = pool_with(acceptor(), ClientOptions::default());
    let mut conn = pool.check_out().unwrap();

    let mut last = 0;
    for _ in 0..10 {
        let next = conn.next_request_id();
        assert!(next > last);
        last = next;
    }
}

#[test]
fn invalidate_discards_idle_and_in_flight() {
    let mut options = ClientOptions::default();
    options.max_pool_size = 4;
    let pool = pool_with(acceptor(), options);

    // One idle, one in flight.
    let idle = pool.check_out().unwrap();
    let in_flight = pool.check_out().unwrap();
    drop(idle);
    assert_eq!((2, 1), {
        let (total, available, _) = pool.stats();
        (total, available)
    });

    pool.invalidate();
    let (total, available, _) = pool.stats();
    assert_eq!((1, 0), (total, available));

    // A stale-generation connection is destroyed at checkin, not pooled.
    drop(in_flight);
    let (total, available, _) = pool.stats();
    assert_eq!((0, 0), (total, available));
}

#[test]
fn closed_pool_rejects_checkouts() {
    let pool = pool_with(acceptor(), ClientOptions::default());
    pool.close();

    match pool.check_out() {
        Err(Error::PoolClosed(_)) => (),
        other => panic!("expected PoolClosed, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn close_wakes_blocked_waiters() {
    let mut options = ClientOptions::default();
    options.max_pool_size = 1;
    options.max_wait_time = Duration::from_secs(10);

    let pool = pool_with(acceptor(), options);
    let _held = pool.check_out().unwrap();

    let contender = pool.clone();
    let waiter = thread::spawn(move || contender.check_out().map(|_| ()));

    thread::sleep(Duration::from_millis(50));
    pool.close();

    match waiter.join().unwrap() {
        Err(Error::PoolClosed(_)) => (),
        other => panic!("expected PoolClosed, got {:?}", other),
    }
}

#[test]
fn maintenance_satisfies_min_pool_size() {
    let mut options = ClientOptions::default();
    options.min_pool_size = 2;
    options.max_pool_size = 4;

    let pool = pool_with(acceptor(), options);
    assert_eq!((0, 0), {
        let (total, available, _) = pool.stats();
        (total, available)
    });

    pool.perform_maintenance();
    let (total, available, _) = pool.stats();
    assert_eq!((2, 2), (total, available));
}

#[test]
fn maintenance_prunes_expired_idle_connections() {
    let mut options = ClientOptions::default();
    options.max_pool_size = 4;
    options.max_connection_idle_time = Some(Duration::from_millis(20));

    let pool = pool_with(acceptor(), options);
    let conn = pool.check_out().unwrap();
    drop(conn);

    thread::sleep(Duration::from_millis(50));
    pool.perform_maintenance();

    let (total, available, _) = pool.stats();
    assert_eq!((0, 0), (total, available));
}
