//! Simulated scan stage.

use acq_core::hw::{Actuator, AxisDescriptor, MoveHandle};
use acq_core::{AcqError, AcqResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Two-axis piezo-style stage with a configurable settle time per move.
pub struct SimStage {
    name: String,
    axes: HashMap<String, AxisDescriptor>,
    position: Arc<Mutex<HashMap<String, f64>>>,
    settle: Duration,
}

impl SimStage {
    pub fn new(name: impl Into<String>, range: (f64, f64)) -> Arc<Self> {
        let axes: HashMap<String, AxisDescriptor> = ["x", "y"]
            .iter()
            .map(|&a| {
                (
                    a.to_string(),
                    AxisDescriptor {
                        range,
                        unit: "m".to_string(),
                    },
                )
            })
            .collect();
        let position = axes.keys().map(|a| (a.clone(), 0.0)).collect();
        Arc::new(Self {
            name: name.into(),
            axes,
            position: Arc::new(Mutex::new(position)),
            settle: Duration::from_micros(200),
        })
    }
}

struct SimMoveHandle {
    position: Arc<Mutex<HashMap<String, f64>>>,
    target: Option<HashMap<String, f64>>,
    settle: Duration,
}

#[async_trait]
impl MoveHandle for SimMoveHandle {
    async fn wait(&mut self, _timeout: Duration) -> AcqResult<()> {
        if let Some(target) = self.target.take() {
            sleep(self.settle).await;
            let mut pos = self.position.lock();
            for (axis, value) in target {
                pos.insert(axis, value);
            }
        }
        Ok(())
    }

    async fn cancel(&mut self) {
        self.target = None;
    }

    fn done(&self) -> bool {
        self.target.is_none()
    }
}

#[async_trait]
impl Actuator for SimStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn axes(&self) -> HashMap<String, AxisDescriptor> {
        self.axes.clone()
    }

    async fn position(&self) -> AcqResult<HashMap<String, f64>> {
        Ok(self.position.lock().clone())
    }

    async fn move_abs(&self, target: HashMap<String, f64>) -> AcqResult<Box<dyn MoveHandle>> {
        for (axis, value) in &target {
            let desc = self
                .axes
                .get(axis)
                .ok_or_else(|| AcqError::validation(format!("unknown axis '{axis}'")))?;
            if *value < desc.range.0 || *value > desc.range.1 {
                return Err(AcqError::validation(format!(
                    "target {value} outside axis '{axis}' range {:?}",
                    desc.range
                )));
            }
        }
        Ok(Box::new(SimMoveHandle {
            position: self.position.clone(),
            target: Some(target),
            settle: self.settle,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_move_and_restore() {
        let stage = SimStage::new("sstage", (-1e-3, 1e-3));
        let before = stage.position().await.unwrap();

        let mut mv = stage
            .move_abs([("x".to_string(), 5e-6)].into_iter().collect())
            .await
            .unwrap();
        assert!(!mv.done());
        mv.wait(Duration::from_secs(1)).await.unwrap();
        assert!(mv.done());
        assert_eq!(stage.position().await.unwrap()["x"], 5e-6);

        let mut back = stage.move_abs(before.clone()).await.unwrap();
        back.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(stage.position().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_out_of_range_rejected() {
        let stage = SimStage::new("sstage", (-1e-6, 1e-6));
        let err = stage
            .move_abs([("x".to_string(), 5e-3)].into_iter().collect())
            .await;
        assert!(err.is_err());
    }
}
