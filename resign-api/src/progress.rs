// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fmt, sync::mpsc::Sender};

use resign_common::Stage;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKind {
    Started,
    Finished,
    /// Extra information in the middle of a stage.
    Detail
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub kind: ProgressKind,
    pub message: String
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ProgressKind::Started => write!(f, "[{}] {}...", self.stage, self.message),
            ProgressKind::Finished => write!(f, "[{}] {} done", self.stage, self.message),
            ProgressKind::Detail => write!(f, "[{}] {}", self.stage, self.message)
        }
    }
}

/// The consumer of a sink went away.
#[derive(Debug, Clone, Error)]
#[error("progress sink is closed")]
pub struct SinkClosed;

/// Receives progress from a running job.
///
/// A failing sink never affects the job: errors are dropped by the
/// pipeline.
pub trait ProgressSink {
    fn report(&self, event: ProgressEvent) -> Result<(), SinkClosed>;
}

impl ProgressSink for Sender<ProgressEvent> {
    fn report(&self, event: ProgressEvent) -> Result<(), SinkClosed> {
        self.send(event).map_err(|_| SinkClosed)
    }
}

/// Writes each event to the `tracing` log.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn report(&self, event: ProgressEvent) -> Result<(), SinkClosed> {
        info!(stage = %event.stage, "{}", event);
        Ok(())
    }
}

pub struct NullSink;

impl ProgressSink for NullSink {
    fn report(&self, _event: ProgressEvent) -> Result<(), SinkClosed> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn closed_channel_reports_error() {
        let (sender, receiver) = channel();
        drop(receiver);
        let event = ProgressEvent {
            stage: Stage::Align,
            kind: ProgressKind::Started,
            message: "Aligning".into()
        };
        assert!(sender.report(event).is_err());
    }

    #[test]
    fn display() {
        let event = ProgressEvent {
            stage: Stage::KeyAcquisition,
            kind: ProgressKind::Started,
            message: "Loading signing key".into()
        };
        assert_eq!(event.to_string(), "[key acquisition] Loading signing key...");
    }
}
