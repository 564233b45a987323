// Cross-process connections through the global manager, over the in-memory
// loopback network and over TCP on localhost
use mtask_core::communication::network::{LoopbackNetwork, TcpTransport, Transport};
use mtask_core::{
    Component, ComponentState, Endpoint, EventWrite, ExecutionResult, FunctionPolicy,
    FunctionRead, FunctionWrite, FunctionWriteReturn, GlobalManager, LocalManager, ManagerConfig,
    MtaskError, Task, TaskContext,
};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Idle;

impl Task for Idle {
    fn run(&mut self, _ctx: &mut TaskContext) {}
}

const WAIT: Duration = Duration::from_secs(2);

struct Provider {
    manager: LocalManager,
    total: Arc<AtomicI64>,
    changed: EventWrite<i64>,
}

/// Process hosting `calc`: Square, Add, Total, Slow and a Changed event
fn provider(config: ManagerConfig) -> Provider {
    let manager = LocalManager::new(config);
    let total = Arc::new(AtomicI64::new(0));
    let calc = Component::periodic("calc", Duration::from_millis(1), Idle);
    let provided = calc.add_interface_provided("Calc").unwrap();
    provided
        .add_command_write_return("Square", |x: &i32| x * x)
        .unwrap();
    let sink = total.clone();
    provided
        .add_command_write("Add", move |x: &i64| {
            sink.fetch_add(*x, Ordering::SeqCst);
        })
        .unwrap();
    let source = total.clone();
    provided
        .add_command_read("Total", move || source.load(Ordering::SeqCst))
        .unwrap();
    provided
        .add_command_write_return("Slow", |ms: &u64| {
            std::thread::sleep(Duration::from_millis(*ms));
            *ms
        })
        .unwrap();
    let changed = provided.add_event_write::<i64>("Changed").unwrap();
    manager.add_component(calc).unwrap();
    Provider {
        manager,
        total,
        changed,
    }
}

struct Client {
    square: FunctionWriteReturn<i32, i32>,
    add: FunctionWrite<i64>,
    total: FunctionRead<i64>,
    slow: FunctionWriteReturn<u64, u64>,
    seen: crossbeam::channel::Receiver<i64>,
}

fn add_client(manager: &LocalManager, name: &str) -> Client {
    let component = Component::passive(name, Idle);
    let required = component.add_interface_required("Calc").unwrap();
    let square = required
        .add_function_write_return::<i32, i32>("Square", FunctionPolicy::Required)
        .unwrap();
    let add = required
        .add_function_write::<i64>("Add", FunctionPolicy::Required)
        .unwrap();
    let total = required
        .add_function_read::<i64>("Total", FunctionPolicy::Required)
        .unwrap();
    let slow = required
        .add_function_write_return::<u64, u64>("Slow", FunctionPolicy::Optional)
        .unwrap();
    let (tx, seen) = crossbeam::channel::unbounded();
    required
        .add_event_handler_write("Changed", FunctionPolicy::Optional, move |value: &i64| {
            let _ = tx.send(*value);
        })
        .unwrap();
    manager.add_component(component).unwrap();
    Client {
        square,
        add,
        total,
        slow,
        seen,
    }
}

fn networked(process: &str, global: &str, listen: Option<&str>) -> ManagerConfig {
    let mut config = ManagerConfig::new(process);
    config.network.global_address = Some(global.to_string());
    config.network.listen_address = listen.map(str::to_string);
    config.network.request_timeout_ms = 1000;
    config
}

fn wait_for_total(total: &Arc<AtomicI64>, expected: i64) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if total.load(Ordering::SeqCst) == expected {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

#[test]
fn test_proxy_call_matches_direct_call() {
    let net = LoopbackNetwork::new();
    let transport: Arc<dyn Transport> = net.clone();

    let p1 = provider(networked("p1", "global", None));
    let (global, _) = p1.manager.host_global(&transport, "global").unwrap();
    p1.manager.join_network(transport.clone()).unwrap();
    let direct = add_client(&p1.manager, "local");
    p1.manager
        .connect_local("local", "Calc", "calc", "Calc")
        .unwrap();

    let p2 = LocalManager::new(networked("p2", "global", None));
    let remote = add_client(&p2, "client");
    p2.join_network(transport.clone()).unwrap();
    p2.connect(
        &Endpoint::new("p2", "client", "Calc"),
        &Endpoint::new("p1", "calc", "Calc"),
    )
    .unwrap();
    assert_eq!(global.connections().len(), 1);
    assert_eq!(global.processes().len(), 2);

    assert!(p1.manager.create_all_and_wait(WAIT).unwrap());
    assert!(p1.manager.start_all_and_wait(WAIT).unwrap());
    assert!(p2.create_all_and_wait(WAIT).unwrap());

    for x in [0, 3, -7, 46340] {
        let (mut local_out, mut remote_out) = (0, 0);
        let local_result = direct.square.execute(&x, &mut local_out);
        let remote_result = remote.square.execute(&x, &mut remote_out);
        assert_eq!(local_result, ExecutionResult::Succeeded);
        assert_eq!(remote_result, local_result);
        assert_eq!(remote_out, local_out);
    }

    // Writes are fire and forget on both paths
    assert_eq!(remote.add.execute(&5), ExecutionResult::Queued);
    assert_eq!(direct.add.execute(&2), ExecutionResult::Queued);
    assert!(wait_for_total(&p1.total, 7));
    let (mut local_total, mut remote_total) = (0, 0);
    assert_eq!(direct.total.execute(&mut local_total), ExecutionResult::Succeeded);
    assert_eq!(remote.total.execute(&mut remote_total), ExecutionResult::Succeeded);
    assert_eq!(local_total, 7);
    assert_eq!(remote_total, 7);

    // Events reach local and remote subscribers alike
    assert_eq!(p1.changed.fire(&42), ExecutionResult::Succeeded);
    assert_eq!(direct.seen.recv_timeout(WAIT).unwrap(), 42);
    assert_eq!(remote.seen.recv_timeout(WAIT).unwrap(), 42);

    // Asynchronous completion across processes
    let (tx, rx) = crossbeam::channel::bounded(1);
    let queued = remote.square.execute_async(&9, move |result, value| {
        let _ = tx.send((result, value));
    });
    assert_eq!(queued, ExecutionResult::Queued);
    assert_eq!(
        rx.recv_timeout(WAIT).unwrap(),
        (ExecutionResult::Succeeded, Some(81))
    );

    p2.kill_all_and_wait(WAIT).unwrap();
    p1.manager.kill_all_and_wait(WAIT).unwrap();
}

#[test]
fn test_disconnect_tears_down_both_sides() {
    let net = LoopbackNetwork::new();
    let transport: Arc<dyn Transport> = net.clone();
    let global = Arc::new(GlobalManager::new());
    global.serve(&transport, "global").unwrap();

    let p1 = provider(networked("p1", "global", None));
    p1.manager.join_network(transport.clone()).unwrap();
    let p2 = LocalManager::new(networked("p2", "global", None));
    let remote = add_client(&p2, "client");
    p2.join_network(transport.clone()).unwrap();

    let id = p2
        .connect(
            &Endpoint::new("p2", "client", "Calc"),
            &Endpoint::new("p1", "calc", "Calc"),
        )
        .unwrap();
    p1.manager.create_all_and_wait(WAIT).unwrap();

    p2.disconnect(id).unwrap();
    assert!(global.connections().is_empty());
    let mut out = 0;
    assert_eq!(remote.square.execute(&2, &mut out), ExecutionResult::FunctionNotBound);
    // No forwarder left behind on the provider
    assert_eq!(p1.changed.fire(&1), ExecutionResult::Succeeded);
    assert!(remote.seen.recv_timeout(Duration::from_millis(50)).is_err());

    p2.leave_network();
    assert_eq!(global.processes().len(), 1);
}

#[test]
fn test_severed_link_is_a_network_error_not_a_hang() {
    let net = LoopbackNetwork::new();
    let transport: Arc<dyn Transport> = net.clone();

    let p1 = provider(networked("p1", "global", None));
    let (_global, _) = p1.manager.host_global(&transport, "global").unwrap();
    p1.manager.join_network(transport.clone()).unwrap();
    let p2 = LocalManager::new(networked("p2", "global", None));
    let remote = add_client(&p2, "client");
    p2.join_network(transport.clone()).unwrap();
    p2.connect(
        &Endpoint::new("p2", "client", "Calc"),
        &Endpoint::new("p1", "calc", "Calc"),
    )
    .unwrap();
    p1.manager.create_all_and_wait(WAIT).unwrap();
    p1.manager.start_all_and_wait(WAIT).unwrap();

    // Cut the link while a call is in flight
    let slow = Arc::new(remote.slow);
    let caller = {
        let slow = slow.clone();
        std::thread::spawn(move || {
            let started = Instant::now();
            let mut out = 0u64;
            let result = slow.execute(&500, &mut out);
            (result, started.elapsed())
        })
    };
    std::thread::sleep(Duration::from_millis(50));
    net.sever("p1");

    let (result, elapsed) = caller.join().unwrap();
    assert_eq!(result, ExecutionResult::NetworkError);
    assert!(elapsed < Duration::from_millis(1000), "took {:?}", elapsed);

    // Later calls fail fast as well
    let mut out = 0;
    let started = Instant::now();
    assert_eq!(remote.square.execute(&3, &mut out), ExecutionResult::NetworkError);
    assert!(started.elapsed() < Duration::from_millis(1000));
    assert_eq!(remote.add.execute(&1), ExecutionResult::NetworkError);

    p1.manager.kill_all_and_wait(WAIT).unwrap();
}

#[test]
fn test_unknown_remote_interface_is_rejected() {
    let net = LoopbackNetwork::new();
    let transport: Arc<dyn Transport> = net.clone();
    let global = Arc::new(GlobalManager::new());
    global.serve(&transport, "global").unwrap();

    let p1 = provider(networked("p1", "global", None));
    p1.manager.join_network(transport.clone()).unwrap();
    let p2 = LocalManager::new(networked("p2", "global", None));
    add_client(&p2, "client");
    p2.join_network(transport.clone()).unwrap();

    let err = p2
        .connect(
            &Endpoint::new("p2", "client", "Calc"),
            &Endpoint::new("p1", "calc", "Missing"),
        )
        .unwrap_err();
    assert!(err.is_not_found());
    let err = p2
        .connect(
            &Endpoint::new("p2", "client", "Calc"),
            &Endpoint::new("p3", "calc", "Calc"),
        )
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(p2.connections().is_empty());
}

#[test]
fn test_unreachable_global_fails_startup() {
    let net = LoopbackNetwork::new();
    let p2 = LocalManager::new(networked("p2", "nowhere", None));
    let err = p2.join_network(net).unwrap_err();
    assert!(matches!(err, MtaskError::Network(_)));
    assert!(p2.context().global().is_none());
}

#[test]
fn test_round_trip_over_tcp() {
    let global_transport: Arc<dyn Transport> = TcpTransport::new(WAIT).unwrap();
    let global = Arc::new(GlobalManager::new());
    let global_address = global.serve(&global_transport, "127.0.0.1:0").unwrap();

    let p1 = provider(networked("p1", &global_address, Some("127.0.0.1:0")));
    let p1_transport: Arc<dyn Transport> = TcpTransport::new(WAIT).unwrap();
    let p1_address = p1.manager.join_network(p1_transport).unwrap();
    assert_ne!(p1_address, "127.0.0.1:0");

    let p2 = LocalManager::new(networked("p2", &global_address, Some("127.0.0.1:0")));
    let remote = add_client(&p2, "client");
    let p2_transport: Arc<dyn Transport> = TcpTransport::new(WAIT).unwrap();
    p2.join_network(p2_transport).unwrap();
    p2.connect(
        &Endpoint::new("p2", "client", "Calc"),
        &Endpoint::new("p1", "calc", "Calc"),
    )
    .unwrap();

    assert!(p1.manager.create_all_and_wait(WAIT).unwrap());
    assert!(p1.manager.start_all_and_wait(WAIT).unwrap());

    let mut out = 0;
    assert_eq!(remote.square.execute(&12, &mut out), ExecutionResult::Succeeded);
    assert_eq!(out, 144);

    assert_eq!(remote.add.execute(&3), ExecutionResult::Queued);
    assert!(wait_for_total(&p1.total, 3));

    assert_eq!(p1.changed.fire(&7), ExecutionResult::Succeeded);
    assert_eq!(remote.seen.recv_timeout(WAIT).unwrap(), 7);

    let processes = global.processes();
    assert!(processes.iter().any(|p| p.name == "p1" && p.address == p1_address));

    p1.manager.kill_all_and_wait(WAIT).unwrap();
    assert_eq!(
        p1.manager.component("calc").unwrap().state(),
        ComponentState::Finished
    );
}
