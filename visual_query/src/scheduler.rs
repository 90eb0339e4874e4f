use crate::{frame::FrameReceiver, model_service::ModelService, pipeline::VisionCore};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};

const IDLE_WARNING_TICKS: u64 = 50;

/// Drives the periodic pass over the newest frame.
pub struct Scheduler<M: ModelService> {
    core: Arc<VisionCore<M>>,
    frames: FrameReceiver,
    period: Duration,
    receive_timeout: Duration,
}

impl<M: ModelService> Scheduler<M> {
    pub fn new(core: Arc<VisionCore<M>>, period: Duration, receive_timeout: Duration) -> Self {
        let frames = core.frames().subscribe();
        Self {
            core,
            frames,
            period,
            receive_timeout,
        }
    }

    /// Spawns the loop. It stops on the shutdown signal; a pass already
    /// running when the signal arrives is completed first.
    pub fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let Scheduler {
            core,
            mut frames,
            period,
            receive_timeout,
        } = self;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut idle_ticks: u64 = 0;

            tracing::info!("Scheduler started with a period of {:?}", period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Scheduler received shutdown signal");
                        break;
                    }
                }

                let frame = tokio::select! {
                    frame = frames.receive_latest(receive_timeout) => frame,
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Scheduler received shutdown signal");
                        break;
                    }
                };
                if frame.is_none() {
                    idle_ticks += 1;
                    if idle_ticks % IDLE_WARNING_TICKS == 0 {
                        tracing::warn!("No frame received after {} ticks", idle_ticks);
                    }
                    continue;
                }
                idle_ticks = 0;

                if core.tick().await.is_none() && core.is_closing() {
                    break;
                }
            }
            tracing::info!("Scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model_service::testing::{detection, ScriptedModel},
        pipeline::tests::core_with,
        query::QueryMode,
    };
    use image::RgbImage;
    use tokio::time::timeout;

    #[tokio::test]
    async fn publishes_every_period() {
        let core = core_with(
            ScriptedModel::fixed(vec![detection("car", 0.9, 0., 0.)]),
            QueryMode::Idle,
            0.5,
        );
        let mut records = core.publisher().subscribe_records();
        core.frames().push(RgbImage::new(64, 48)).unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = Scheduler::new(core.clone(), Duration::from_millis(10), Duration::from_millis(5))
            .run(shutdown_rx);

        for _ in 0..3 {
            let record = timeout(Duration::from_secs(2), records.recv())
                .await
                .expect("a record every period")
                .unwrap();
            assert_eq!(record.record.targets()[0].label, "car");
        }

        shutdown_tx.send(()).unwrap();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn ticks_pick_up_query_changes() {
        let core = core_with(ScriptedModel::fixed(Vec::new()), QueryMode::Idle, 0.5);
        let mut records = core.publisher().subscribe_records();
        core.frames().push(RgbImage::new(64, 48)).unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = Scheduler::new(core.clone(), Duration::from_millis(10), Duration::from_millis(5))
            .run(shutdown_rx);

        records.recv().await.unwrap();
        core.query().set_query(QueryMode::Label("cup".to_string()));
        loop {
            records.recv().await.unwrap();
            if let Some(result) = core.frames().latest_result() {
                if result.query.mode == QueryMode::Label("cup".to_string()) {
                    break;
                }
            }
        }

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn idles_without_frames_and_stops_on_shutdown() {
        let core = core_with(ScriptedModel::fixed(Vec::new()), QueryMode::Idle, 0.5);
        let mut records = core.publisher().subscribe_records();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = Scheduler::new(core.clone(), Duration::from_millis(5), Duration::from_millis(5))
            .run(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(records.try_recv().is_err());

        shutdown_tx.send(()).unwrap();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
