//! Completion pump: drain the CQ and dispatch by work-request class.

use std::mem;

use rdma_sys::*;

use crate::error::{Error, Result};
use crate::session::Session;
use crate::verbs::cq::wc_status_str;
use crate::verbs::wr::WrId;

impl Session {
    /// Poll one work completion and dispatch it.
    ///
    /// A control-RECV completion observed while a READY token is owed is
    /// the READY arriving, wherever the session happened to be waiting;
    /// the credit is banked for the next SEND. An RDMA-WRITE completion
    /// retires one signaled write. Any non-success status is fatal.
    pub(crate) fn poll_once(&mut self) -> Result<Option<WrId>> {
        let cq = self.cq_handle()?;
        // SAFETY: POD type.
        let mut wc = unsafe { mem::zeroed::<ibv_wc>() };
        if !cq.poll_one(&mut wc)? {
            return Ok(None);
        }

        if wc.status != ibv_wc_status::IBV_WC_SUCCESS {
            return Err(Error::Completion {
                wr_id: wc.wr_id,
                status: wc.status,
                msg: wc_status_str(wc.status),
            });
        }

        let wrid = WrId::from_raw(wc.wr_id)
            .ok_or_else(|| Error::Fatal(format!("completion for unknown work request {}", wc.wr_id)))?;

        if wrid.is_ctrl_recv() && self.credits.awaiting() {
            log::trace!("READY token banked from {wrid:?}");
            self.credits.grant();
        }
        if wrid == WrId::RdmaWrite {
            self.batch.completed();
            log::trace!("write retired, {} signaled in flight", self.batch.inflight());
        }

        Ok(Some(wrid))
    }

    /// Poll until the CQ is empty or `target` completes.
    fn drain_until(&mut self, target: WrId) -> Result<bool> {
        loop {
            match self.poll_once()? {
                None => return Ok(false),
                Some(wrid) if wrid == target => return Ok(true),
                Some(other) => {
                    log::trace!("wanted {target:?}, drained {other:?}");
                }
            }
        }
    }

    /// Opportunistically retire completions without blocking.
    pub(crate) fn drain_available(&mut self) -> Result<()> {
        while self.poll_once()?.is_some() {}
        Ok(())
    }

    /// Block until a work request of class `target` completes.
    ///
    /// Arms CQ notification, drains, then sleeps on the completion
    /// channel; channel events are accumulated and acknowledged in one
    /// batch on the way out.
    #[cfg(not(feature = "busy-poll"))]
    pub(crate) fn wait_for_wrid(&mut self, target: WrId) -> Result<()> {
        let cq = self.cq_handle()?;
        cq.req_notify()?;

        if self.drain_until(target)? {
            return Ok(());
        }

        let channel = self.comp_channel_handle()?;
        let mut num_events = 0u32;
        let result = loop {
            if let Err(e) = channel.get_event() {
                break Err(e.into());
            }
            num_events += 1;
            if let Err(e) = cq.req_notify() {
                break Err(e.into());
            }
            match self.drain_until(target) {
                Ok(true) => break Ok(()),
                Ok(false) => continue,
                Err(e) => break Err(e),
            }
        };

        if num_events > 0 {
            cq.ack_events(num_events);
        }
        result
    }

    /// Busy-poll until a work request of class `target` completes.
    #[cfg(feature = "busy-poll")]
    pub(crate) fn wait_for_wrid(&mut self, target: WrId) -> Result<()> {
        while !self.drain_until(target)? {
            std::hint::spin_loop();
        }
        Ok(())
    }
}
