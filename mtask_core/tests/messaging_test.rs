// Cross-thread messaging: mailbox ordering, serialized command execution,
// lifecycle shutdown and name-based binding
use mtask_core::communication::mailbox::MailboxEntry;
use mtask_core::{
    Component, ComponentKind, ComponentOptions, ComponentState, ExecutionResult, FunctionPolicy,
    LocalManager, Mailbox, Task, TaskContext,
};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Idle;

impl Task for Idle {
    fn run(&mut self, _ctx: &mut TaskContext) {}
}

/// Counts cleanups so a test can check shutdown happened exactly once
struct Tracked {
    cleanups: Arc<AtomicUsize>,
}

impl Task for Tracked {
    fn run(&mut self, _ctx: &mut TaskContext) {}

    fn cleanup(&mut self, _ctx: &mut TaskContext) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[test]
fn test_concurrent_writes_execute_one_at_a_time() {
    let manager = LocalManager::standalone("scenario");

    let calls = Arc::new(AtomicU64::new(0));
    let sum = Arc::new(AtomicI64::new(0));
    let overlapped = Arc::new(AtomicBool::new(false));
    let busy = Arc::new(AtomicBool::new(false));

    let server = Component::new(
        "A",
        ComponentKind::Periodic(Duration::from_millis(1)),
        Idle,
        ComponentOptions {
            mailbox_capacity: 2048,
            ..ComponentOptions::default()
        },
    );
    {
        let calls = calls.clone();
        let sum = sum.clone();
        let overlapped = overlapped.clone();
        let busy = busy.clone();
        server
            .add_interface_provided("Data")
            .unwrap()
            .add_command_write("Write", move |x: &i64| {
                // Non-reentrant guard
                if busy.swap(true, Ordering::SeqCst) {
                    overlapped.store(true, Ordering::SeqCst);
                }
                std::thread::yield_now();
                sum.fetch_add(*x, Ordering::SeqCst);
                calls.fetch_add(1, Ordering::SeqCst);
                busy.store(false, Ordering::SeqCst);
            })
            .unwrap();
    }
    manager.add_component(server).unwrap();

    let client = Component::continuous("B", Idle);
    let write = client
        .add_interface_required("Data")
        .unwrap()
        .add_function_write::<i64>("Write", FunctionPolicy::Required)
        .unwrap();
    manager.add_component(client).unwrap();
    manager.connect_local("B", "Data", "A", "Data").unwrap();

    assert!(manager.create_all_and_wait(Duration::from_secs(2)).unwrap());
    assert!(manager.start_all_and_wait(Duration::from_secs(2)).unwrap());

    let write = Arc::new(write);
    let producers: Vec<_> = (0..4i64)
        .map(|t| {
            let write = write.clone();
            std::thread::spawn(move || {
                for i in 0..250i64 {
                    let value = t * 1000 + i;
                    assert_eq!(write.execute(&value), ExecutionResult::Queued);
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || calls.load(Ordering::SeqCst) == 1000));
    assert_eq!(calls.load(Ordering::SeqCst), 1000);
    let expected: i64 = (0..4i64)
        .map(|t| (0..250i64).map(|i| t * 1000 + i).sum::<i64>())
        .sum();
    assert_eq!(sum.load(Ordering::SeqCst), expected);
    assert!(!overlapped.load(Ordering::SeqCst));

    assert!(manager.kill_all_and_wait(Duration::from_secs(2)).unwrap());
}

#[test]
fn test_mailbox_preserves_each_producers_order() {
    let mailbox = Mailbox::new("fifo", 4096);
    let drained = Arc::new(Mutex::new(Vec::new()));
    let per_producer = 500usize;

    let producers: Vec<_> = (0..4usize)
        .map(|producer| {
            let mailbox = mailbox.clone();
            let drained = drained.clone();
            std::thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for seq in 0..per_producer {
                    let drained = drained.clone();
                    let entry = MailboxEntry::notify("record", move || {
                        drained.lock().push((producer, seq));
                    });
                    assert_eq!(mailbox.push(entry), ExecutionResult::Queued);
                    if rng.gen_bool(0.2) {
                        std::thread::yield_now();
                    }
                }
            })
        })
        .collect();

    // Drain while producers are still pushing
    let mut executed = 0;
    while executed < 4 * per_producer {
        executed += mailbox.drain_all();
        std::thread::yield_now();
    }
    for producer in producers {
        producer.join().unwrap();
    }

    let drained = drained.lock();
    assert_eq!(drained.len(), 4 * per_producer);
    for producer in 0..4 {
        let sequence: Vec<usize> = drained
            .iter()
            .filter(|(p, _)| *p == producer)
            .map(|(_, seq)| *seq)
            .collect();
        assert_eq!(sequence, (0..per_producer).collect::<Vec<_>>());
    }
}

#[test]
fn test_full_mailbox_reports_instead_of_blocking() {
    let mailbox = Mailbox::new("tiny", 2);
    assert_eq!(mailbox.push(MailboxEntry::notify("a", || {})), ExecutionResult::Queued);
    assert_eq!(mailbox.push(MailboxEntry::notify("b", || {})), ExecutionResult::Queued);
    assert_eq!(
        mailbox.push(MailboxEntry::notify("c", || {})),
        ExecutionResult::MailboxFull
    );
    assert_eq!(mailbox.drain_all(), 2);
}

#[test]
fn test_kill_reaches_finished_once_from_every_state() {
    for stop_in in [
        ComponentState::Constructed,
        ComponentState::Ready,
        ComponentState::Active,
    ] {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let component = Component::periodic(
            "victim",
            Duration::from_millis(1),
            Tracked {
                cleanups: cleanups.clone(),
            },
        );
        let provided = component.add_interface_provided("Api").unwrap();
        provided.add_command_void("Poke", || {}).unwrap();
        let poke = provided.command("Poke").unwrap();

        if stop_in != ComponentState::Constructed {
            assert!(component.create_and_wait(Duration::from_secs(2)).unwrap());
        }
        if stop_in == ComponentState::Active {
            assert!(component.start_and_wait(Duration::from_secs(2)).unwrap());
        }

        component.kill().unwrap();
        // The mailbox refuses work as soon as kill returns
        let (result, _) = poke.call(None, mtask_core::CallMode::Default);
        assert_eq!(result, ExecutionResult::Disabled);

        assert!(component.wait_for_state(ComponentState::Finished, Duration::from_secs(2)));
        component.kill().unwrap();
        assert_eq!(component.state(), ComponentState::Finished);
        assert!(component.join());

        let expected = if stop_in == ComponentState::Constructed { 0 } else { 1 };
        assert_eq!(cleanups.load(Ordering::SeqCst), expected, "killed while {}", stop_in);
    }
}

#[test]
fn test_blocking_call_on_killed_component_returns() {
    struct Slow;

    impl Task for Slow {
        fn run(&mut self, _ctx: &mut TaskContext) {
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    let component = Arc::new(Component::continuous("slow", Slow));
    let provided = component.add_interface_provided("Api").unwrap();
    provided.add_command_void_return("Answer", || 42i32).unwrap();
    let answer = provided.command("Answer").unwrap();
    assert!(component.create_and_wait(Duration::from_secs(2)).unwrap());
    assert!(component.start_and_wait(Duration::from_secs(2)).unwrap());

    let caller = std::thread::spawn(move || {
        let started = Instant::now();
        let (result, _) = answer.call(
            None,
            mtask_core::CallMode::Blocking(Some(Duration::from_secs(5))),
        );
        (result, started.elapsed())
    });
    std::thread::sleep(Duration::from_millis(20));
    component.kill().unwrap();

    let (result, elapsed) = caller.join().unwrap();
    assert!(
        result == ExecutionResult::Succeeded || result == ExecutionResult::Disabled,
        "unexpected {}",
        result
    );
    assert!(elapsed < Duration::from_secs(5));
    assert!(component.wait_for_state(ComponentState::Finished, Duration::from_secs(2)));
}

#[test]
fn test_binding_leaves_unmatched_functions_unbound() {
    let manager = LocalManager::standalone("binding");
    let server = Component::passive("server", Idle);
    let provided = server.add_interface_provided("Robot").unwrap();
    provided.add_command_void("Home", || {}).unwrap();
    provided.add_command_write("Move", |_: &f64| {}).unwrap();
    provided.add_command_read("Position", || 1.25f64).unwrap();
    manager.add_component(server).unwrap();

    let client = Component::passive("client", Idle);
    let required = client.add_interface_required("Robot").unwrap();
    let home = required.add_function_void("Home", FunctionPolicy::Optional).unwrap();
    let position = required
        .add_function_read::<f64>("Position", FunctionPolicy::Optional)
        .unwrap();
    let calibrate = required
        .add_function_void("Calibrate", FunctionPolicy::Optional)
        .unwrap();
    manager.add_component(client).unwrap();

    let id = manager.connect_local("client", "Robot", "server", "Robot").unwrap();
    manager.create_all_and_wait(Duration::from_secs(1)).unwrap();

    assert_eq!(home.execute(), ExecutionResult::Succeeded);
    let mut value = 0.0f64;
    assert_eq!(position.execute(&mut value), ExecutionResult::Succeeded);
    assert_eq!(value, 1.25);
    assert_eq!(calibrate.execute(), ExecutionResult::FunctionNotBound);

    let connection = manager
        .connections()
        .into_iter()
        .find(|c| c.id == id)
        .unwrap();
    assert_eq!(connection.provided.component, "server");
}

#[test]
fn test_role_and_type_mismatches() {
    let manager = LocalManager::standalone("types");
    let server = Component::passive("server", Idle);
    let provided = server.add_interface_provided("Api").unwrap();
    provided.add_command_write("Set", |_: &i32| {}).unwrap();
    provided.add_command_write("Scale", |_: &f64| {}).unwrap();
    manager.add_component(server).unwrap();

    let client = Component::passive("client", Idle);
    let required = client.add_interface_required("Api").unwrap();
    required
        .add_function_void("Set", FunctionPolicy::Required)
        .unwrap();
    manager.add_component(client).unwrap();

    // A void function cannot bind to a write command
    assert!(manager.connect_local("client", "Api", "server", "Api").is_err());
    assert!(manager.connections().is_empty());

    let other = Component::passive("other", Idle);
    let scale = other
        .add_interface_required("Api")
        .unwrap()
        .add_function_write::<String>("Scale", FunctionPolicy::Required)
        .unwrap();
    manager.add_component(other).unwrap();
    manager.connect_local("other", "Api", "server", "Api").unwrap();
    // Argument types are checked per call
    assert_eq!(
        scale.execute(&"twice".to_string()),
        ExecutionResult::InvalidInputType
    );
}

#[test]
fn test_panicking_handlers_do_not_stop_the_component() {
    let manager = LocalManager::standalone("fragile");
    let server = Component::periodic("server", Duration::from_millis(1), Idle);
    let provided = server.add_interface_provided("Api").unwrap();
    provided
        .add_command_void("Boom", || panic!("handler failure"))
        .unwrap();
    provided.add_command_void_return("Answer", || 7i32).unwrap();
    let tick = provided.add_event_void("Tick").unwrap();
    manager.add_component(server).unwrap();

    let handled = Arc::new(AtomicUsize::new(0));
    let client = Component::periodic("client", Duration::from_millis(1), Idle);
    let required = client.add_interface_required("Api").unwrap();
    let boom = required
        .add_function_void("Boom", FunctionPolicy::Required)
        .unwrap();
    let answer = required
        .add_function_void_return::<i32>("Answer", FunctionPolicy::Required)
        .unwrap();
    {
        let handled = handled.clone();
        required
            .add_event_handler_void("Tick", FunctionPolicy::Required, move || {
                if handled.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first tick fails");
                }
            })
            .unwrap();
    }
    manager.add_component(client).unwrap();
    manager.connect_local("client", "Api", "server", "Api").unwrap();
    assert!(manager.create_all_and_wait(Duration::from_secs(2)).unwrap());
    assert!(manager.start_all_and_wait(Duration::from_secs(2)).unwrap());

    assert_eq!(boom.execute(), ExecutionResult::Queued);
    assert_eq!(boom.execute_blocking(), ExecutionResult::CommandFailed);
    let mut out = 0;
    assert_eq!(answer.execute(&mut out), ExecutionResult::Succeeded);
    assert_eq!(out, 7);

    assert!(tick.fire().is_ok());
    assert!(tick.fire().is_ok());
    assert!(wait_until(Duration::from_secs(5), || handled.load(Ordering::SeqCst) == 2));

    let server = manager.component("server").unwrap();
    assert_eq!(
        server
            .command_mailbox()
            .unwrap()
            .metrics()
            .failed
            .load(Ordering::Relaxed),
        2
    );
    assert!(manager.kill_all_and_wait(Duration::from_secs(2)).unwrap());
    assert_eq!(server.state(), ComponentState::Finished);
}

#[test]
fn test_failed_reconnect_keeps_previous_binding() {
    let manager = LocalManager::standalone("rebind");
    let hits = Arc::new(AtomicUsize::new(0));
    let server = Component::periodic("server", Duration::from_millis(1), Idle);
    {
        let hits = hits.clone();
        server
            .add_interface_provided("Api")
            .unwrap()
            .add_command_void("Ping", move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    manager.add_component(server).unwrap();

    // Offers the interface but not the command the client requires
    let bare = Component::passive("bare", Idle);
    bare.add_interface_provided("Api").unwrap();
    manager.add_component(bare).unwrap();

    let client = Component::passive("client", Idle);
    let ping = client
        .add_interface_required("Api")
        .unwrap()
        .add_function_void("Ping", FunctionPolicy::Required)
        .unwrap();
    manager.add_component(client).unwrap();

    let id = manager.connect_local("client", "Api", "server", "Api").unwrap();
    assert!(manager.create_all_and_wait(Duration::from_secs(2)).unwrap());
    assert!(manager.start_all_and_wait(Duration::from_secs(2)).unwrap());

    assert!(manager
        .connect_local("client", "Api", "missing", "Api")
        .unwrap_err()
        .is_not_found());
    assert!(manager.connect_local("client", "Api", "bare", "Api").is_err());

    assert_eq!(ping.execute_blocking(), ExecutionResult::Succeeded);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    let ids: Vec<_> = manager.connections().iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![id]);

    assert!(manager.kill_all_and_wait(Duration::from_secs(2)).unwrap());
}

#[test]
fn test_killed_passive_component_refuses_direct_calls() {
    let manager = LocalManager::standalone("passive");
    let device = Component::passive("device", Idle);
    let provided = device.add_interface_provided("Io").unwrap();
    provided.add_command_write("Set", |_: &i32| {}).unwrap();
    provided.add_command_read("Get", || 3i32).unwrap();
    manager.add_component(device).unwrap();

    let client = Component::passive("client", Idle);
    let required = client.add_interface_required("Io").unwrap();
    let set = required
        .add_function_write::<i32>("Set", FunctionPolicy::Required)
        .unwrap();
    let get = required
        .add_function_read::<i32>("Get", FunctionPolicy::Required)
        .unwrap();
    manager.add_component(client).unwrap();
    manager.connect_local("client", "Io", "device", "Io").unwrap();
    assert!(manager.create_all_and_wait(Duration::from_secs(1)).unwrap());

    let mut value = 0;
    assert_eq!(set.execute(&1), ExecutionResult::Succeeded);
    assert_eq!(get.execute(&mut value), ExecutionResult::Succeeded);
    assert_eq!(value, 3);

    let device = manager.component("device").unwrap();
    device.kill().unwrap();
    assert_eq!(device.state(), ComponentState::Finished);
    assert_eq!(set.execute(&2), ExecutionResult::Disabled);
    assert_eq!(get.execute(&mut value), ExecutionResult::Disabled);
}
