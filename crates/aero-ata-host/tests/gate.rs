mod common;

use std::sync::Arc;
use std::thread;

use aero_ata_host::testing::{CompletionLog, SimChannel};
use aero_ata_host::{
    AtaBus, AtaError, BusConfig, BusState, Command, CommandGate, FakeHostClock, Opcode, TaskFile,
    Unit, ATA_CMD_FLUSH_CACHE,
};
use common::{disk, flush, init_tracing};

fn gated_bus() -> (Arc<CommandGate<AtaBus<SimChannel, FakeHostClock>>>, SimChannel) {
    init_tracing();
    let clock = FakeHostClock::new();
    let sim = SimChannel::new(clock.clone());
    sim.attach(Unit::Device0, disk());
    sim.attach(Unit::Device1, disk());
    let mut bus = AtaBus::new(sim.clone(), clock, BusConfig::default()).unwrap();
    assert_eq!(bus.start(), 2);
    (Arc::new(CommandGate::new(bus)), sim)
}

#[test]
fn polled_submissions_from_many_threads_all_complete() {
    let (gate, _sim) = gated_bus();
    let log = CompletionLog::new();

    let workers: Vec<_> = (0..4u8)
        .map(|worker| {
            let gate = gate.clone();
            let log = log.clone();
            thread::spawn(move || {
                let unit = if worker % 2 == 0 {
                    Unit::Device0
                } else {
                    Unit::Device1
                };
                for i in 0..5u8 {
                    let command = Command::builder(Opcode::ExecIo, unit)
                        .task_file(TaskFile {
                            features: worker * 16 + i,
                            command: ATA_CMD_FLUSH_CACHE,
                            ..TaskFile::default()
                        })
                        .irq_suppressed(true)
                        .on_complete(log.recorder())
                        .build()
                        .unwrap();
                    gate.execute_command(command).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let done = log.take();
    assert_eq!(done.len(), 20);
    assert!(done.iter().all(|c| c.result() == Some(&Ok(()))));
    // Each worker's commands stay in its own submission order.
    for worker in 0..4u8 {
        let mine: Vec<u8> = done
            .iter()
            .map(|c| c.task_file().features)
            .filter(|tag| tag / 16 == worker)
            .collect();
        assert_eq!(mine, (0..5).map(|i| worker * 16 + i).collect::<Vec<_>>());
    }
    assert_eq!(
        gate.run_action(|bus| bus.bus_state()).unwrap(),
        BusState::Free
    );
}

#[test]
fn interrupts_are_delivered_through_the_gate() {
    let (gate, sim) = gated_bus();
    let log = CompletionLog::new();

    for tag in 0..3 {
        gate.execute_command(flush(Unit::Device0, tag, &log)).unwrap();
    }

    let mut steps = 0;
    while log.len() < 3 {
        assert!(steps < 100, "commands did not finish");
        steps += 1;
        if sim.interrupt_pending() {
            gate.handle_interrupt().unwrap();
        } else {
            assert!(!gate.poll_timer().unwrap());
        }
    }

    assert_eq!(
        gate.handle_interrupt(),
        Err(AtaError::SpuriousInterrupt)
    );
}

#[test]
fn poisoned_gate_hands_the_command_back() {
    let (gate, _sim) = gated_bus();
    let log = CompletionLog::new();

    let poisoner = gate.clone();
    let _ = thread::spawn(move || {
        poisoner
            .run_action(|_bus| panic!("driver bug"))
            .unwrap();
    })
    .join();

    let rejected = gate
        .execute_command(flush(Unit::Device0, 1, &log))
        .unwrap_err();
    assert_eq!(rejected.error, AtaError::GatePoisoned);
    assert_eq!(rejected.into_command().task_file().features, 1);
    assert_eq!(gate.poll_timer(), Err(AtaError::GatePoisoned));
    assert!(log.is_empty());
}
