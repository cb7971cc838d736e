//! Front-panel push buttons.
//!
//! Each button latches rising edges in hardware. The panel polls the
//! latches, drops edges that arrive within the debounce window of the last
//! accepted one and hands the rest to a callback.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::hardware::{ButtonInput, ButtonSet};
use crate::scheduler::{Clock, StopSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ButtonAction {
    IncreaseSetpoint,
    DecreaseSetpoint,
    IncreaseMotor,
    DecreaseMotor,
}

struct Button {
    action: ButtonAction,
    input: Box<dyn ButtonInput>,
    last_accepted: Option<Instant>,
}

pub struct ButtonPanel {
    buttons: Vec<Button>,
    debounce: Duration,
    poll_interval: Duration,
    clock: Arc<dyn Clock>,
}

impl ButtonPanel {
    pub fn new(
        set: ButtonSet,
        debounce: Duration,
        poll_interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let buttons = [
            (ButtonAction::IncreaseSetpoint, set.increase_temperature),
            (ButtonAction::DecreaseSetpoint, set.decrease_temperature),
            (ButtonAction::IncreaseMotor, set.increase_motor),
            (ButtonAction::DecreaseMotor, set.decrease_motor),
        ]
        .into_iter()
        .map(|(action, input)| Button {
            action,
            input,
            last_accepted: None,
        })
        .collect();
        Self {
            buttons,
            debounce,
            poll_interval,
            clock,
        }
    }

    /// Check every latch once and return the accepted presses.
    pub fn poll(&mut self) -> Vec<ButtonAction> {
        let now = self.clock.now();
        let mut pressed = Vec::new();
        for button in &mut self.buttons {
            match button.input.take_edge() {
                Ok(true) => {
                    let bounced = button
                        .last_accepted
                        .is_some_and(|t| now.saturating_duration_since(t) < self.debounce);
                    if bounced {
                        tracing::trace!("Ignoring bounce on {:?}", button.action);
                    } else {
                        button.last_accepted = Some(now);
                        pressed.push(button.action);
                    }
                }
                Ok(false) => {}
                Err(e) => tracing::warn!("Reading {:?} button failed: {}", button.action, e),
            }
        }
        pressed
    }

    /// Disable edge detection on every button.
    pub fn release(&mut self) {
        for button in &mut self.buttons {
            if let Err(e) = button.input.release() {
                tracing::warn!("Releasing {:?} button failed: {}", button.action, e);
            }
        }
    }

    /// Poll loop. Returns once `stop` is raised, with the buttons released.
    pub fn run<F>(mut self, stop: StopSignal, mut on_press: F)
    where
        F: FnMut(ButtonAction),
    {
        tracing::info!(
            "Button loop started (debounce {} ms)",
            self.debounce.as_millis()
        );
        while !stop.is_stopped() {
            for action in self.poll() {
                tracing::debug!("Button pressed: {:?}", action);
                on_press(action);
            }
            self.clock.sleep(self.poll_interval);
        }
        self.release();
        tracing::info!("Button loop stopped");
    }
}
