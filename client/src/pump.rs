// Copyright (C) 2019  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Reception loop.
//!
//! The receive ring is drained entry by entry, in order. Plain frames are passed to the frame
//! callback. GSO frames are validated, then either passed whole to the GSO callback if there is
//! one, or carved into segments that are each passed to the frame callback. Every entry is
//! skipped exactly once, including the ones that are dropped.

use crate::{context::IntNetIf, error::Error};
use intnet_core::{
    gso::{ChecksumPolicy, GSO_CONTEXT_SIZE, MIN_SCRATCH_SIZE},
    GsoContext, RingEntry,
};
use std::sync::atomic::Ordering;

/// Callback receiving Ethernet frames.
pub type FrameCallback<'a> = &'a mut dyn FnMut(&[u8]);
/// Callback receiving GSO super-frames along with their context.
pub type GsoCallback<'a> = &'a mut dyn FnMut(&GsoContext, &[u8]);

impl IntNetIf {
    /// Processes all the entries currently in the receive ring. Returns the number of frames and
    /// super-frames delivered.
    ///
    /// If `on_gso` is `None`, GSO super-frames are carved and each segment is passed to
    /// `on_frame`, with complete checksums.
    pub fn drain(&self, on_frame: FrameCallback, mut on_gso: Option<GsoCallback>) -> Result<usize, Error> {
        self.drain_with(on_frame, &mut on_gso)
    }

    fn drain_with(
        &self,
        on_frame: FrameCallback,
        on_gso: &mut Option<GsoCallback>,
    ) -> Result<usize, Error> {
        let buf = self.buffer()?;
        let mut ring = buf.recv();
        let mut scratch = [0u8; MIN_SCRATCH_SIZE];
        let mut segment = Vec::new();
        let mut delivered = 0;

        loop {
            match ring.peek()? {
                None => return Ok(delivered),
                Some(RingEntry::Frame(frame)) => {
                    log::trace!("received frame of {} bytes", frame.len());
                    on_frame(frame);
                    delivered += 1;
                }
                Some(RingEntry::Gso { context, frame }) => {
                    match context.validate(GSO_CONTEXT_SIZE + frame.len(), frame.len()) {
                        Ok(_) => {
                            match on_gso {
                                Some(on_gso) => (*on_gso)(&context, frame),
                                None => {
                                    let count = context.segment_count(frame.len());
                                    for index in 0..count {
                                        let carved = context.carve_segment(
                                            frame,
                                            index,
                                            count,
                                            &mut scratch,
                                            ChecksumPolicy::Complete,
                                        );
                                        match carved {
                                            Ok(seg) => {
                                                seg.assemble(&scratch, frame, &mut segment);
                                                on_frame(&segment);
                                            }
                                            Err(err) => {
                                                log::warn!("failed to carve segment {}: {}", index, err);
                                                buf.record_bad_frame();
                                                break;
                                            }
                                        }
                                    }
                                }
                            }
                            delivered += 1;
                        }
                        Err(err) => {
                            log::warn!("dropping invalid GSO frame {:?}: {}", context, err);
                            buf.record_bad_frame();
                        }
                    }
                }
                Some(RingEntry::Padding(_)) => {}
                Some(RingEntry::Other { kind, len }) => {
                    log::debug!("skipping entry of unknown type {:#x} ({} bytes)", kind, len);
                    buf.record_bad_frame();
                }
            }

            ring.skip()?;
        }
    }

    /// Receives frames until stopped through an [`AbortHandle`](crate::AbortHandle).
    ///
    /// Alternates between draining the receive ring and waiting. Returns `Ok` once stopped, after
    /// a final drain. Any other failure is returned as an error.
    pub fn pump_packets(
        &self,
        on_frame: FrameCallback,
        mut on_gso: Option<GsoCallback>,
    ) -> Result<(), Error> {
        log::debug!("starting packet pump on {:?}", self.handle);

        loop {
            self.drain_with(on_frame, &mut on_gso)?;

            if self.stop.swap(false, Ordering::AcqRel) {
                log::debug!("packet pump on {:?} stopped", self.handle);
                return Ok(());
            }

            match self.wait(self.wait_timeout_ms) {
                Ok(_) => {}
                Err(Error::WaitAborted) => {
                    self.drain_with(on_frame, &mut on_gso)?;
                    self.stop.store(false, Ordering::Release);
                    log::debug!("packet pump on {:?} aborted", self.handle);
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    }
}
