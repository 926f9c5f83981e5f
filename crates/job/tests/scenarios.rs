//! End-to-end orchestration scenarios against a simulated endpoint pair.

use std::path::Path;

use time::macros::datetime;
use time::UtcOffset;

use endpoint::{Endpoint, EndpointUrl, Interrupt};
use job::test_utils::{FakeClock, FakeConnector, FakeHost};
use job::{InitOptions, Job, JobError, PurgeOptions, UpdateOptions};
use location::JobDescriptor;

fn local(path: &str) -> EndpointUrl {
    EndpointUrl::local(path)
}

fn parse_retention(text: &str) -> retention::RetentionExpression {
    text.parse().expect("retention expression parses")
}

fn init_options(source: &str, destination: &str) -> InitOptions {
    InitOptions {
        source: local(source),
        destination: local(destination),
        source_retention: Some(parse_retention("3")),
        destination_retention: Some(parse_retention("3")),
        compress: false,
    }
}

fn local_pair() -> (FakeHost, FakeConnector) {
    let host = FakeHost::local();
    host.mkdir_all(Path::new("/"));
    host.mkdir_all(Path::new("/bk"));
    (host.clone(), FakeConnector::single(host))
}

#[test]
fn cold_init_then_first_run() {
    let (host, connector) = local_pair();
    let mut job = Job::init(&connector, init_options("/", "/bk")).expect("init succeeds");

    let clock = FakeClock::at(datetime!(2024-01-01 03:00:00 UTC));
    let name = job.run(&clock, &Interrupt::new()).expect("first run succeeds");

    assert_eq!(name.to_string(), "sx-20240101-030000-utc");
    assert_eq!(
        host.entries(Path::new("/.sxbackup")),
        vec!["sx-20240101-030000-utc"]
    );
    assert_eq!(host.entries(Path::new("/bk")), vec!["sx-20240101-030000-utc"]);
    assert!(host.file(Path::new("/.sxbackup/.btrfs-sxbackup")).is_some());
    assert!(host.file(Path::new("/bk/.btrfs-sxbackup")).is_some());

    // An empty destination is the normal cold start: the stream is full.
    let streams = host.received_streams();
    assert_eq!(streams.len(), 1);
    assert!(streams[0].contains("parent=-"), "unexpected: {}", streams[0]);
}

#[test]
fn incremental_run_uses_the_common_parent() {
    let (host, connector) = local_pair();
    let mut job = Job::init(&connector, init_options("/", "/bk")).expect("init succeeds");

    host.mkdir_all(Path::new("/.sxbackup/sx-20240101-030000-utc"));
    host.mkdir_all(Path::new("/bk/sx-20240101-030000-utc"));

    let clock = FakeClock::at(datetime!(2024-01-02 03:00:00 UTC));
    let name = job.run(&clock, &Interrupt::new()).expect("run succeeds");

    assert_eq!(name.to_string(), "sx-20240102-030000-utc");
    assert_eq!(
        host.entries(Path::new("/.sxbackup")),
        vec!["sx-20240101-030000-utc", "sx-20240102-030000-utc"]
    );
    assert_eq!(
        host.entries(Path::new("/bk")),
        vec!["sx-20240101-030000-utc", "sx-20240102-030000-utc"]
    );

    let streams = host.received_streams();
    assert_eq!(streams.len(), 1);
    assert!(
        streams[0].contains("parent=sx-20240101-030000-utc"),
        "unexpected: {}",
        streams[0]
    );
}

#[test]
fn mismatched_histories_fall_back_to_a_full_transfer() {
    let (host, connector) = local_pair();
    let mut job = Job::init(&connector, init_options("/", "/bk")).expect("init succeeds");

    host.mkdir_all(Path::new("/.sxbackup/sx-20240101-010000-utc"));
    host.mkdir_all(Path::new("/.sxbackup/sx-20240101-020000-utc"));
    host.mkdir_all(Path::new("/bk/sx-20231231-010000-utc"));

    let clock = FakeClock::at(datetime!(2024-01-02 03:00:00 UTC));
    let name = job.run(&clock, &Interrupt::new()).expect("run succeeds");

    let streams = host.received_streams();
    assert_eq!(streams.len(), 1);
    assert!(streams[0].contains("parent=-"), "unexpected: {}", streams[0]);
    assert_eq!(
        host.entries(Path::new("/bk")),
        vec!["sx-20231231-010000-utc".to_string(), name.to_string()]
    );
}

#[test]
fn failed_transfer_leaves_both_sides_as_they_were() {
    let (host, connector) = local_pair();
    let mut job = Job::init(&connector, init_options("/", "/bk")).expect("init succeeds");

    host.mkdir_all(Path::new("/.sxbackup/sx-20240101-030000-utc"));
    host.mkdir_all(Path::new("/bk/sx-20240101-030000-utc"));
    let source_descriptor = host
        .file(Path::new("/.sxbackup/.btrfs-sxbackup"))
        .expect("descriptor written");
    let destination_descriptor = host
        .file(Path::new("/bk/.btrfs-sxbackup"))
        .expect("descriptor written");

    host.fail_next_receive(1);
    let clock = FakeClock::at(datetime!(2024-01-02 03:00:00 UTC));
    let error = job
        .run(&clock, &Interrupt::new())
        .expect_err("failing receive aborts the run");
    assert!(matches!(error, JobError::Transfer(_)), "got {error:?}");

    // The orphan source snapshot is gone and the destination is untouched.
    assert_eq!(
        host.entries(Path::new("/.sxbackup")),
        vec!["sx-20240101-030000-utc"]
    );
    assert_eq!(host.entries(Path::new("/bk")), vec!["sx-20240101-030000-utc"]);
    assert_eq!(
        host.file(Path::new("/.sxbackup/.btrfs-sxbackup")),
        Some(source_descriptor)
    );
    assert_eq!(
        host.file(Path::new("/bk/.btrfs-sxbackup")),
        Some(destination_descriptor)
    );
}

#[test]
fn destroy_with_unreachable_destination_still_cleans_up_locally() {
    let local_host = FakeHost::local();
    local_host.mkdir_all(Path::new("/data"));
    let remote_host = FakeHost::remote("nas");
    remote_host.mkdir_all(Path::new("/pool"));
    let connector = FakeConnector::single(local_host.clone()).with_remote("nas", remote_host.clone());

    Job::init(
        &connector,
        InitOptions {
            source: local("/data"),
            destination: EndpointUrl::parse("ssh://nas/pool").expect("url parses"),
            source_retention: None,
            destination_retention: None,
            compress: false,
        },
    )
    .expect("init succeeds");

    remote_host.set_unreachable();
    let job = Job::load(&connector, &local("/data")).expect("load tolerates the dead peer");
    job.destroy(false).expect("destroy succeeds despite the dead peer");

    assert!(local_host
        .file(Path::new("/data/.sxbackup/.btrfs-sxbackup"))
        .is_none());
    // The far side keeps its state until it is reachable again.
    assert!(remote_host.file(Path::new("/pool/.btrfs-sxbackup")).is_some());
}

#[test]
fn run_across_two_hosts_pumps_the_stream() {
    let local_host = FakeHost::local();
    local_host.mkdir_all(Path::new("/data"));
    let remote_host = FakeHost::remote("nas");
    remote_host.mkdir_all(Path::new("/pool"));
    let connector = FakeConnector::single(local_host.clone()).with_remote("nas", remote_host.clone());

    let mut job = Job::init(
        &connector,
        InitOptions {
            source: local("/data"),
            destination: EndpointUrl::parse("ssh://nas/pool").expect("url parses"),
            source_retention: Some(parse_retention("3")),
            destination_retention: Some(parse_retention("3")),
            compress: true,
        },
    )
    .expect("init succeeds");

    let clock = FakeClock::at(datetime!(2024-06-01 12:00:00 UTC));
    let name = job.run(&clock, &Interrupt::new()).expect("run succeeds");

    assert_eq!(
        remote_host.entries(Path::new("/pool")),
        vec![name.to_string()]
    );
    assert_eq!(remote_host.received_streams().len(), 1);
    assert!(local_host
        .dir_exists(&Path::new("/data/.sxbackup").join(name.to_string())));
}

#[test]
fn run_applies_retention_on_both_sides() {
    let (host, connector) = local_pair();
    let mut job = Job::init(
        &connector,
        InitOptions {
            source: local("/"),
            destination: local("/bk"),
            source_retention: Some(parse_retention("1")),
            destination_retention: Some(parse_retention("2")),
            compress: false,
        },
    )
    .expect("init succeeds");

    for day in ["01", "02"] {
        host.mkdir_all(&Path::new("/.sxbackup").join(format!("sx-202401{day}-030000-utc")));
        host.mkdir_all(&Path::new("/bk").join(format!("sx-202401{day}-030000-utc")));
    }

    let clock = FakeClock::at(datetime!(2024-01-03 03:00:00 UTC));
    let name = job.run(&clock, &Interrupt::new()).expect("run succeeds");

    // Source keeps only the newest snapshot, the destination the newest two.
    assert_eq!(host.entries(Path::new("/.sxbackup")), vec![name.to_string()]);
    assert_eq!(
        host.entries(Path::new("/bk")),
        vec!["sx-20240102-030000-utc".to_string(), name.to_string()]
    );
}

#[test]
fn run_refuses_when_the_clock_is_behind_the_inventory() {
    let (host, connector) = local_pair();
    let mut job = Job::init(&connector, init_options("/", "/bk")).expect("init succeeds");

    host.mkdir_all(Path::new("/.sxbackup/sx-20240610-000000-utc"));
    let clock = FakeClock::at(datetime!(2024-06-01 00:00:00 UTC));

    let error = job
        .run(&clock, &Interrupt::new())
        .expect_err("stale clock refused");
    assert!(matches!(error, JobError::Config(_)), "got {error:?}");
    assert!(error.to_string().contains("system time"));
}

#[test]
fn run_requires_an_initialized_destination() {
    let (host, connector) = local_pair();
    Job::init(&connector, init_options("/", "/bk")).expect("init succeeds");
    host.remove_file(Path::new("/bk/.btrfs-sxbackup"))
        .expect("fake remove succeeds");

    let mut job = Job::load(&connector, &local("/")).expect("load succeeds");
    let error = job
        .run(&FakeClock::at(datetime!(2024-01-01 00:00:00 UTC)), &Interrupt::new())
        .expect_err("uninitialized destination refused");
    assert!(error.to_string().contains("init"), "got {error}");
}

#[test]
fn update_leaves_compression_alone_unless_asked() {
    let (host, connector) = local_pair();
    let mut job = Job::init(&connector, init_options("/", "/bk")).expect("init succeeds");

    job.update(UpdateOptions {
        source_retention: Some(parse_retention("5")),
        ..UpdateOptions::default()
    })
    .expect("update succeeds");

    let text = host
        .file(Path::new("/bk/.btrfs-sxbackup"))
        .expect("descriptor present");
    let descriptor = JobDescriptor::parse(&String::from_utf8_lossy(&text)).expect("parses");
    assert!(!descriptor.compress, "compression must stay off");
    assert_eq!(descriptor.source_retention.to_string(), "5");

    job.update(UpdateOptions {
        compress: Some(true),
        ..UpdateOptions::default()
    })
    .expect("update succeeds");
    let text = host
        .file(Path::new("/bk/.btrfs-sxbackup"))
        .expect("descriptor present");
    let descriptor = JobDescriptor::parse(&String::from_utf8_lossy(&text)).expect("parses");
    assert!(descriptor.compress);
}

#[test]
fn mismatched_descriptors_block_run_until_updated() {
    let (host, connector) = local_pair();
    Job::init(&connector, init_options("/", "/bk")).expect("init succeeds");

    // Simulate a half-applied update on the destination copy.
    let text = host.file(Path::new("/bk/.btrfs-sxbackup")).expect("descriptor present");
    let mut peer = JobDescriptor::parse(&String::from_utf8_lossy(&text)).expect("parses");
    peer.destination_retention = parse_retention("9");
    host.put_file(Path::new("/bk/.btrfs-sxbackup"), peer.render().as_bytes());

    let clock = FakeClock::at(datetime!(2024-01-01 00:00:00 UTC));
    let mut job = Job::load(&connector, &local("/")).expect("load succeeds");
    let error = job
        .run(&clock, &Interrupt::new())
        .expect_err("disagreeing copies refused");
    assert!(error.to_string().contains("update"), "got {error}");

    let mut job = Job::load(&connector, &local("/")).expect("load succeeds");
    job.update(UpdateOptions::default()).expect("update re-synchronises");

    let mut job = Job::load(&connector, &local("/")).expect("load succeeds");
    job.run(&clock, &Interrupt::new()).expect("run succeeds after update");
}

#[test]
fn purge_overrides_apply_once_and_are_not_persisted() {
    let (host, connector) = local_pair();
    let job = Job::init(&connector, init_options("/", "/bk")).expect("init succeeds");

    for day in ["01", "02", "03"] {
        host.mkdir_all(&Path::new("/.sxbackup").join(format!("sx-202401{day}-030000-utc")));
        host.mkdir_all(&Path::new("/bk").join(format!("sx-202401{day}-030000-utc")));
    }
    let before = host
        .file(Path::new("/.sxbackup/.btrfs-sxbackup"))
        .expect("descriptor present");

    let clock = FakeClock::at(datetime!(2024-02-01 00:00:00 UTC));
    job.purge(
        &clock,
        PurgeOptions {
            source_retention: Some(parse_retention("1")),
            destination_retention: None,
        },
    )
    .expect("purge succeeds");

    assert_eq!(
        host.entries(Path::new("/.sxbackup")),
        vec!["sx-20240103-030000-utc"]
    );
    // Destination used its stored "3": nothing to drop.
    assert_eq!(host.entries(Path::new("/bk")).len(), 3);
    assert_eq!(
        host.file(Path::new("/.sxbackup/.btrfs-sxbackup")),
        Some(before),
        "purge must not rewrite descriptors"
    );
}

#[test]
fn destroy_with_purge_removes_snapshots_and_container() {
    let (host, connector) = local_pair();
    let job = Job::init(&connector, init_options("/", "/bk")).expect("init succeeds");

    host.mkdir_all(Path::new("/.sxbackup/sx-20240101-030000-utc"));
    host.mkdir_all(Path::new("/bk/sx-20240101-030000-utc"));

    job.destroy(true).expect("destroy succeeds");

    assert!(!host.dir_exists(Path::new("/.sxbackup")));
    assert!(host.file(Path::new("/bk/.btrfs-sxbackup")).is_none());
    assert!(host.dir_exists(Path::new("/bk")), "destination container stays");
    assert_eq!(host.entries(Path::new("/bk")), Vec::<String>::new());
}

#[test]
fn job_loads_from_the_destination_side_too() {
    let (host, connector) = local_pair();
    let mut job = Job::init(&connector, init_options("/", "/bk")).expect("init succeeds");

    let clock = FakeClock::at(datetime!(2024-01-01 03:00:00 UTC));
    job.run(&clock, &Interrupt::new()).expect("first run succeeds");

    let mut reloaded = Job::load(&connector, &local("/bk")).expect("load from destination");
    assert_eq!(reloaded.source_url().to_string(), "/");
    clock.set(datetime!(2024-01-02 03:00:00 UTC));
    reloaded
        .run(&clock, &Interrupt::new())
        .expect("run from the destination side");
    assert_eq!(host.entries(Path::new("/bk")).len(), 2);
}

#[test]
fn legacy_container_name_keeps_working() {
    let host = FakeHost::local();
    host.mkdir_all(Path::new("/data"));
    host.mkdir_all(Path::new("/data/sxbackup"));
    host.mkdir_all(Path::new("/bk"));
    let connector = FakeConnector::single(host.clone());

    // A job written by an old version: descriptor inside `sxbackup`.
    let descriptor = JobDescriptor::new(
        Some(local("/data")),
        Some(local("/bk")),
        "sxbackup".into(),
        parse_retention("3"),
        parse_retention("3"),
        false,
    );
    host.put_file(
        Path::new("/data/sxbackup/.btrfs-sxbackup"),
        descriptor.render().as_bytes(),
    );
    host.put_file(Path::new("/bk/.btrfs-sxbackup"), descriptor.render().as_bytes());

    let mut job = Job::load(&connector, &local("/data")).expect("legacy job loads");
    let clock = FakeClock::at(datetime!(2024-01-01 03:00:00 UTC));
    job.run(&clock, &Interrupt::new()).expect("legacy job runs");

    assert_eq!(
        host.entries(Path::new("/data/sxbackup")),
        vec!["sx-20240101-030000-utc"]
    );
}

#[test]
fn info_renders_both_sides() {
    let (_host, connector) = local_pair();
    let mut job = Job::init(&connector, init_options("/", "/bk")).expect("init succeeds");
    job.run(
        &FakeClock::at(datetime!(2024-01-01 03:00:00 UTC)),
        &Interrupt::new(),
    )
    .expect("run succeeds");

    let mut rendered = Vec::new();
    job.info(&mut rendered, UtcOffset::UTC).expect("info renders");
    let text = String::from_utf8(rendered).expect("utf-8");

    assert!(text.contains("Source URL"));
    assert!(text.contains("Destination URL"));
    assert!(text.contains("sx-20240101-030000-utc"));
    assert!(text.contains("Source retention"));
}

#[test]
fn snapshot_creation_detects_name_collisions() {
    let host = FakeHost::local();
    host.mkdir_all(Path::new("/data"));
    host.mkdir_all(Path::new("/data/.sxbackup"));

    let store = location::SnapshotStore::new(
        std::sync::Arc::new(host.clone()),
        "/data/.sxbackup",
    );
    let now = datetime!(2024-01-01 03:00:00 UTC);
    store.create(Path::new("/data"), now).expect("first create succeeds");
    let error = store
        .create(Path::new("/data"), now)
        .expect_err("same-second create collides");
    assert!(matches!(error, location::StoreError::NameCollision { .. }));
    assert!(host.dir_exists(Path::new("/data/.sxbackup/sx-20240101-030000-utc")));
}
