use std::time::{Duration, Instant};

use mongocore::connstring;
use mongocore::options::ClientOptions;
use mongocore::topology::server::ServerType;
use mongocore::topology::TopologyType;
use mongocore::Client;

use crate::mock::{MockServer, MockState};

fn wait_for<F: Fn(&Client) -> bool>(client: &Client, timeout: Duration, check: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check(client) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

fn server_type(client: &Client) -> Option<ServerType> {
    client
        .topology()
        .description_snapshot()
        .1
        .into_iter()
        .next()
        .map(|(_, desc)| desc.server_type)
}

// Only the literal "isdbgrid" marker makes a server a shard router; any
// other msg value falls through to the replica-set and standalone rules.
#[test]
fn shard_routers_are_classified_by_the_isdbgrid_marker() {
    use bson::{bson, doc};
    use mongocore::topology::monitor::IsMasterResult;
    use mongocore::topology::server::ServerDescription;

    let router = IsMasterResult::new(doc! {
        "ismaster": true,
        "msg": "isdbgrid",
        "ok": 1.0,
    }).unwrap();
    let mut desc = ServerDescription::new();
    desc.update(router, 1);
    assert_eq!(ServerType::Mongos, desc.server_type);

    let chatty_primary = IsMasterResult::new(doc! {
        "ismaster": true,
        "msg": "settings incomplete",
        "setName": "rs0",
        "ok": 1.0,
    }).unwrap();
    let mut desc = ServerDescription::new();
    desc.update(chatty_primary, 1);
    assert_eq!(ServerType::RSPrimary, desc.server_type);

    let chatty_standalone = IsMasterResult::new(doc! {
        "ismaster": true,
        "msg": "settings incomplete",
        "ok": 1.0,
    }).unwrap();
    let mut desc = ServerDescription::new();
    desc.update(chatty_standalone, 1);
    assert_eq!(ServerType::Standalone, desc.server_type);
}

// A reachable server is discovered, reported Unknown when it goes away, and
// rediscovered when it comes back.
#[test]
fn monitor_tracks_server_availability() {
    let mut server = MockServer::start(MockState::default());
    let port = server.port;

    let config = connstring::parse(&server.uri()).unwrap();
    let mut options = ClientOptions::default();
    options.heartbeat_frequency = Duration::from_millis(100);
    let client = Client::with_config(&config, options, None, None).unwrap();

    assert!(
        wait_for(&client, Duration::from_secs(5), |c| {
            server_type(c) == Some(ServerType::Standalone)
        }),
        "server was never discovered"
    );
    assert_eq!(TopologyType::Single, client.topology().description_snapshot().0);

    server.stop();

    assert!(
        wait_for(&client, Duration::from_secs(5), |c| {
            let snapshot = c.topology().description_snapshot().1;
            snapshot
                .first()
                .map_or(false, |&(_, ref desc)| {
                    desc.server_type == ServerType::Unknown && !desc.ok
                })
        }),
        "server loss was never observed"
    );

    let mut revived = MockServer::start_on(port, MockState::default());

    assert!(
        wait_for(&client, Duration::from_secs(5), |c| {
            server_type(c) == Some(ServerType::Standalone)
        }),
        "server recovery was never observed"
    );

    client.close();
    revived.stop();
}

// Closing the client stops its monitors; the description stops changing.
#[test]
fn close_joins_the_monitors() {
    let server = MockServer::start(MockState::default());

    let config = connstring::parse(&server.uri()).unwrap();
    let mut options = ClientOptions::default();
    options.heartbeat_frequency = Duration::from_millis(50);
    let client = Client::with_config(&config, options, None, None).unwrap();

    assert!(wait_for(&client, Duration::from_secs(5), |c| {
        server_type(c) == Some(ServerType::Standalone)
    }));

    client.close();

    // Selection after close fails instead of hanging.
    assert!(client.write_session().is_err());
}
