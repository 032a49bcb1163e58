//! Autofocus worker
//!
//! Turns sensor autofocus on, polls the result control every 10 ms while the
//! search is in progress, then turns autofocus off and reports the outcome
//! through a FOCUS notification (1 focused, 0 otherwise).

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::callbacks::MessageType;
use crate::camera::Core;
use crate::error::Result;
use crate::v4l2::{af_status, cid, DeviceGateway, NodeId, AUTO_FOCUS_OFF, AUTO_FOCUS_ON};
use crate::worker::{Worker, STOP_TIMEOUT};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusOutcome {
    Focused,
    Failed,
    Cancelled,
}

impl FocusOutcome {
    /// First argument of the FOCUS notification.
    pub fn notify_value(self) -> i32 {
        match self {
            FocusOutcome::Focused => 1,
            FocusOutcome::Failed | FocusOutcome::Cancelled => 0,
        }
    }
}

pub(crate) fn start_autofocus(core: &Arc<Core>) -> Result<()> {
    let worker_core = Arc::clone(core);
    core.autofocus
        .launch(move |worker| autofocus_loop(&worker_core, worker))?;
    debug!("autofocus started");
    Ok(())
}

pub(crate) fn stop_autofocus(core: &Core) {
    if !core.autofocus.is_busy() {
        debug!("autofocus not running");
        return;
    }
    core.autofocus.stop(STOP_TIMEOUT);
}

fn autofocus_loop(core: &Core, worker: &Worker) {
    let gateway = core.gateway.as_ref();
    let outcome = run_focus(gateway, worker);

    if let Err(e) = gateway.set_control(NodeId::PREVIEW, cid::CAMERA_SET_AUTO_FOCUS, AUTO_FOCUS_OFF) {
        error!("unable to turn autofocus off: {}", e);
    }

    info!("autofocus finished: {:?}", outcome);
    core.metrics.record_focus(outcome == FocusOutcome::Focused);
    core.notify(MessageType::FOCUS, outcome.notify_value(), 0);
}

/// One focus search, polling until the sensor settles or the worker stops.
pub(crate) fn run_focus(gateway: &dyn DeviceGateway, worker: &Worker) -> FocusOutcome {
    let node = NodeId::PREVIEW;
    if let Err(e) = gateway.set_control(node, cid::CAMERA_SET_AUTO_FOCUS, AUTO_FOCUS_ON) {
        error!("unable to start autofocus: {}", e);
        return FocusOutcome::Failed;
    }

    loop {
        if !worker.is_enabled() {
            return FocusOutcome::Cancelled;
        }

        let status = match gateway.get_control(node, cid::CAMERA_AUTO_FOCUS_RESULT) {
            Ok(status) => status,
            Err(e) => {
                error!("unable to read autofocus result: {}", e);
                return FocusOutcome::Failed;
            }
        };

        if status & af_status::IN_PROGRESS != 0 {
            if !worker.pause(POLL_INTERVAL) {
                return FocusOutcome::Cancelled;
            }
            continue;
        }

        return match status {
            af_status::SUCCESS | af_status::FIRST_SUCCESS => FocusOutcome::Focused,
            af_status::FAIL => FocusOutcome::Failed,
            other => {
                warn!("unknown autofocus status {:#x}", other);
                FocusOutcome::Failed
            }
        };
    }
}
