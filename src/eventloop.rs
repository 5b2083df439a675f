use log::{debug, error, info, warn};
use std::{future::Future, sync::Arc};
use tokio::{
    select,
    task::JoinSet,
    time::{self, Duration},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    battery::Generator,
    modbus::RegisterMap,
    mqtt::{Publisher, TelemetrySink},
};

pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Runs periodic jobs at a fixed rate until shut down.
///
/// Every firing is spawned as its own task, so a slow invocation never delays
/// the next one and invocations of the same job may overlap.
pub struct Scheduler {
    token: CancellationToken,
    tracker: TaskTracker,
    grace: Duration,
}

impl Scheduler {
    pub fn new(grace: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            grace,
        }
    }

    /// Fires `job` immediately and then every `period`.
    pub fn spawn_fixed_rate<F, Fut>(&self, name: &'static str, period: Duration, job: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut timer = time::interval(period);
        timer.set_missed_tick_behavior(time::MissedTickBehavior::Burst);

        let token = self.token.clone();
        let grace = self.grace;

        self.tracker.spawn(async move {
            let mut running = JoinSet::new();

            loop {
                select! {
                    _ = token.cancelled() => break,
                    _ = timer.tick() => {
                        running.spawn(job());
                    },
                    Some(res) = running.join_next(), if !running.is_empty() => {
                        if let Err(e) = res {
                            error!("Scheduled {name} invocation failed: {e}");
                        }
                    },
                }
            }

            debug!("Stopped {name} trigger, waiting for {} in-flight invocations", running.len());

            let drained = time::timeout(grace, async {
                while let Some(res) = running.join_next().await {
                    if let Err(e) = res {
                        error!("Scheduled {name} invocation failed: {e}");
                    }
                }
            })
            .await;

            if drained.is_err() {
                warn!("Cancelling {} {name} invocations still running after {grace:?}", running.len());
                running.shutdown().await;
            }
        });
    }

    /// Stops all triggers, waits up to the grace period for running invocations and aborts the rest.
    pub async fn shutdown(&self) {
        info!("Stopping scheduler");

        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        info!("Scheduler stopped");
    }
}

/// Registers the simulation and publish jobs.
pub fn start<S: TelemetrySink>(
    scheduler: &Scheduler,
    generator: Arc<Generator>,
    register_map: Arc<RegisterMap>,
    publisher: Arc<Publisher<S>>,
    simulation_interval: Duration,
    publish_interval: Duration,
) {
    info!("Publish interval: {publish_interval:?}");
    info!("Simulation interval: {simulation_interval:?}");

    {
        let generator = Arc::clone(&generator);

        scheduler.spawn_fixed_rate("publish", publish_interval, move || {
            let generator = Arc::clone(&generator);
            let publisher = Arc::clone(&publisher);

            async move { publisher.publish(generator.snapshot()).await }
        });
    }

    scheduler.spawn_fixed_rate("simulate", simulation_interval, move || {
        let generator = Arc::clone(&generator);
        let register_map = Arc::clone(&register_map);

        async move { simulate(&generator, &register_map) }
    });
}

/// One simulation step: advance the battery and mirror it into the registers.
pub fn simulate(generator: &Generator, register_map: &RegisterMap) {
    let (mode, state) = generator.tick();
    debug!("Battery tick in {mode:?} mode: {state:?}");

    register_map.update(state.voltage, state.temperature, state.current, state.soc);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        battery::{BatteryState, MAX_SOC, MIN_SOC},
        config::DeviceId,
        modbus::registers,
    };
    use std::{
        future,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl TelemetrySink for RecordingSink {
        fn send(&self, payload: Vec<u8>) -> impl Future<Output = anyhow::Result<()>> + Send {
            self.sent.lock().unwrap().push(payload);
            future::ready(Ok(()))
        }
    }

    fn initial() -> BatteryState {
        BatteryState {
            soc: 85.0,
            voltage: 52.5,
            current: 15.0,
            temperature: 25.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_immediately_then_at_fixed_rate() {
        let scheduler = Scheduler::new(SHUTDOWN_GRACE);
        let count = Arc::new(AtomicUsize::new(0));

        {
            let count = Arc::clone(&count);
            scheduler.spawn_fixed_rate("count", Duration::from_millis(100), move || {
                let count = Arc::clone(&count);
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        time::sleep(Duration::from_millis(350)).await;
        scheduler.shutdown().await;

        // t = 0, 100, 200, 300
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_invocations_overlap_instead_of_delaying_the_cadence() {
        let scheduler = Scheduler::new(SHUTDOWN_GRACE);
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        {
            let started = Arc::clone(&started);
            let finished = Arc::clone(&finished);
            scheduler.spawn_fixed_rate("slow", Duration::from_millis(100), move || {
                let started = Arc::clone(&started);
                let finished = Arc::clone(&finished);
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    time::sleep(Duration::from_millis(250)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        time::sleep(Duration::from_millis(350)).await;
        assert_eq!(started.load(Ordering::SeqCst), 4);

        scheduler.shutdown().await;
        assert_eq!(finished.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_invocations_past_the_grace_period() {
        let scheduler = Scheduler::new(Duration::from_secs(1));
        let finished = Arc::new(AtomicUsize::new(0));

        {
            let finished = Arc::clone(&finished);
            scheduler.spawn_fixed_rate("stuck", Duration::from_secs(60), move || {
                let finished = Arc::clone(&finished);
                async move {
                    time::sleep(Duration::from_secs(3600)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        time::sleep(Duration::from_millis(10)).await;

        let before = time::Instant::now();
        scheduler.shutdown().await;

        assert!(before.elapsed() < Duration::from_secs(2));
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_invocation_does_not_stop_the_trigger() {
        let scheduler = Scheduler::new(SHUTDOWN_GRACE);
        let count = Arc::new(AtomicUsize::new(0));

        {
            let count = Arc::clone(&count);
            scheduler.spawn_fixed_rate("flaky", Duration::from_millis(100), move || {
                let count = Arc::clone(&count);
                async move {
                    if count.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("first run fails");
                    }
                }
            });
        }

        time::sleep(Duration::from_millis(250)).await;
        scheduler.shutdown().await;

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn simulate_mirrors_generator_into_registers() {
        let generator = Generator::with_seed(initial(), false, 5);
        let register_map = RegisterMap::new();

        for _ in 0..50 {
            simulate(&generator, &register_map);

            let state = generator.snapshot();
            let words = register_map.read(0, 31).unwrap();

            assert!((MIN_SOC..=MAX_SOC).contains(&state.soc));
            assert_eq!(words[0] as i16, registers::encode(state.voltage, registers::VOLTAGE_SCALE));
            assert_eq!(words[10] as i16, registers::encode(state.temperature, registers::TEMPERATURE_SCALE));
            assert_eq!(words[20] as i16, registers::encode(state.current, registers::CURRENT_SCALE));
            assert_eq!(words[30] as i16, registers::encode(state.soc, registers::STATE_OF_CHARGE_SCALE));
        }
    }

    #[test]
    fn simulate_writes_the_state_of_its_own_tick() {
        let generator = Generator::with_seed(initial(), true, 11);
        let twin = Generator::with_seed(initial(), true, 11);
        let register_map = RegisterMap::new();

        for _ in 0..50 {
            simulate(&generator, &register_map);
            let (_, expected) = twin.tick();

            let image = registers::encode_image(expected.voltage, expected.temperature, expected.current, expected.soc);
            assert_eq!(register_map.read(0, 31).unwrap(), image.unwrap().to_vec());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_drives_both_paths() {
        let scheduler = Scheduler::new(SHUTDOWN_GRACE);
        let generator = Arc::new(Generator::with_seed(initial(), false, 9));
        let register_map = Arc::new(RegisterMap::new());
        let publisher = Arc::new(Publisher::new(
            DeviceId::new("BMS-001").unwrap(),
            RecordingSink::default(),
        ));

        start(
            &scheduler,
            Arc::clone(&generator),
            Arc::clone(&register_map),
            Arc::clone(&publisher),
            Duration::from_millis(100),
            Duration::from_millis(200),
        );

        time::sleep(Duration::from_millis(450)).await;
        scheduler.shutdown().await;

        assert_ne!(register_map.read(30, 1).unwrap(), vec![0]);

        let sent = publisher_payloads(&publisher);
        // t = 0, 200, 400
        assert_eq!(sent.len(), 3);
        for payload in sent {
            let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
            assert_eq!(json["deviceId"], "BMS-001");
            assert_eq!(json["cellVoltages"].as_array().unwrap().len(), 16);
        }
    }

    fn publisher_payloads(publisher: &Publisher<RecordingSink>) -> Vec<Vec<u8>> {
        publisher.sink().sent.lock().unwrap().clone()
    }
}
