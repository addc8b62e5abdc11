use std::time::Duration;

use super::stage::Stage;

/// Progress message sent by the layer pipeline after each step finishes
#[derive(Debug, Clone, PartialEq)]
pub struct LayerStatus {
    pub layer_nr: u32,
    pub stage: Stage,
    pub steps_done: usize,
    pub steps_total: usize,
    pub elapsed: Duration,
    pub ok: bool,
}

impl LayerStatus {
    pub fn new(
        layer_nr: u32,
        stage: Stage,
        steps_done: usize,
        steps_total: usize,
        elapsed: Duration,
        ok: bool,
    ) -> Self {
        Self {
            layer_nr,
            stage,
            steps_done,
            steps_total,
            elapsed,
            ok,
        }
    }

    pub fn progress(&self) -> f32 {
        if self.steps_total == 0 {
            return 1.0;
        }
        self.steps_done as f32 / self.steps_total as f32
    }
}
