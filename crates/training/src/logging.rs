use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::{BufMut, BytesMut};
use prost::Message;

use crate::{metrics::Errors, TrainingError};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub run_id: String,
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_config(config: &crate::TrainingConfig) -> Self {
        let logging = &config.runtime.logging;
        Self {
            run_id: config.id.clone(),
            enable_stdout: logging.enable_stdout,
            tensorboard_dir: logging.tensorboard_dir.clone(),
            tensorboard_flush_every_n: logging.tensorboard_flush_every_n.max(1),
        }
    }
}

/// Position of a training step inside the run.
#[derive(Debug, Clone, Copy)]
pub struct StepPosition {
    pub epoch: usize,
    pub last_epoch: usize,
    pub iter: usize,
    pub iters_per_epoch: usize,
    pub total_steps: usize,
}

pub struct Logger {
    settings: LoggingSettings,
    events: Option<EventFile>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let events = match settings.tensorboard_dir.as_deref() {
            Some(dir) => Some(EventFile::open(
                dir,
                &settings.run_id,
                settings.tensorboard_flush_every_n,
            )?),
            None => None,
        };
        Ok(Self { settings, events })
    }

    pub fn log_training_step(
        &mut self,
        position: StepPosition,
        learning_rates: &[(String, f64)],
        errors: &Errors,
    ) {
        if self.settings.enable_stdout {
            let rates: Vec<String> = learning_rates
                .iter()
                .map(|(name, lr)| format!("lr_{name}: {lr:.3e}"))
                .collect();
            log::info!(
                "[{}] Train [epoch: {}/{}, iter: {}/{}, total_iter: {}] {} | {}",
                self.settings.run_id,
                position.epoch,
                position.last_epoch,
                position.iter,
                position.iters_per_epoch,
                position.total_steps,
                rates.join(", "),
                errors
            );
        }

        if let Some(events) = self.events.as_mut() {
            let scalars = errors
                .iter()
                .map(|(name, value)| (format!("train/{name}"), value))
                .chain(
                    learning_rates
                        .iter()
                        .map(|(name, lr)| (format!("lr/{name}"), *lr)),
                );
            if let Err(err) = events.append(position.total_steps, scalars) {
                log::warn!("dropping tensorboard record: {err}");
            }
        }
    }

    pub fn log_evaluation(&mut self, epoch: usize, total_steps: usize, errors: &Errors) {
        if self.settings.enable_stdout {
            log::info!(
                "[{}] Test [epoch: {}, total_iter: {}] {}",
                self.settings.run_id,
                epoch,
                total_steps,
                errors
            );
        }

        if let Some(events) = self.events.as_mut() {
            let scalars = errors
                .iter()
                .map(|(name, value)| (format!("test/{name}"), value));
            if let Err(err) = events.append(total_steps, scalars) {
                log::warn!("dropping tensorboard record: {err}");
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(events) = self.events.as_mut() {
            if let Err(err) = events.flush() {
                log::warn!("failed to flush tensorboard events: {err}");
            }
        }
    }
}

/// Append-only TensorBoard event file. Every record is framed as
/// `len (u64) | masked crc(len) | payload | masked crc(payload)`.
struct EventFile {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl EventFile {
    fn open(dir: &Path, run_id: &str, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "events.out.tfevents.{}.{}.{}",
            unix_seconds() as u64,
            hostname(),
            run_id
        ));
        let mut file = Self {
            writer: BufWriter::new(File::create(&path)?),
            flush_every: flush_every.max(1),
            pending: 0,
        };
        file.write_event(&Event {
            wall_time: unix_seconds(),
            step: 0,
            file_version: Some(FILE_VERSION.to_string()),
            summary: None,
        })?;
        file.flush()?;
        log::debug!("tensorboard events at {}", path.display());
        Ok(file)
    }

    /// Writes all `scalars` as one event at `step`.
    fn append<I>(&mut self, step: usize, scalars: I) -> Result<(), TrainingError>
    where
        I: IntoIterator<Item = (String, f64)>,
    {
        let value: Vec<SummaryValue> = scalars
            .into_iter()
            .map(|(tag, value)| SummaryValue {
                tag,
                simple_value: Some(value as f32),
            })
            .collect();
        if value.is_empty() {
            return Ok(());
        }
        self.write_event(&Event {
            wall_time: unix_seconds(),
            step: step as i64,
            file_version: None,
            summary: Some(Summary { value }),
        })?;
        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        self.writer.write_all(&frame_record(&event.encode_to_vec()))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush()?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for EventFile {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

const FILE_VERSION: &str = "brain.Event:2";

fn frame_record(payload: &[u8]) -> BytesMut {
    let mut record = BytesMut::with_capacity(payload.len() + 16);
    let len = (payload.len() as u64).to_le_bytes();
    record.put_slice(&len);
    record.put_u32_le(masked_crc32(&len));
    record.put_slice(payload);
    record.put_u32_le(masked_crc32(payload));
    record
}

fn masked_crc32(data: &[u8]) -> u32 {
    let crc = crc32fast::hash(data);
    crc.rotate_right(15).wrapping_add(0xa282_ead8)
}

fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Subset of `tensorflow.Event`.
#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<SummaryValue>,
}

#[derive(Clone, PartialEq, Message)]
struct SummaryValue {
    #[prost(string, tag = "1")]
    tag: String,
    #[prost(float, optional, tag = "2")]
    simple_value: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_records(bytes: &[u8]) -> Vec<Event> {
        let mut events = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let mut len_bytes = [0u8; 8];
            len_bytes.copy_from_slice(&bytes[offset..offset + 8]);
            assert_eq!(
                &bytes[offset + 8..offset + 12],
                &masked_crc32(&len_bytes).to_le_bytes()
            );
            let len = u64::from_le_bytes(len_bytes) as usize;
            let payload = &bytes[offset + 12..offset + 12 + len];
            assert_eq!(
                &bytes[offset + 12 + len..offset + 16 + len],
                &masked_crc32(payload).to_le_bytes()
            );
            events.push(Event::decode(payload).expect("valid event"));
            offset += 16 + len;
        }
        events
    }

    #[test]
    fn event_file_starts_with_version_record() -> Result<(), TrainingError> {
        let dir = tempfile::tempdir()?;
        {
            let mut events = EventFile::open(dir.path(), "run", 1)?;
            events.append(
                3,
                vec![("train/loss_L1".to_string(), 0.25), ("lr/G".to_string(), 2e-4)],
            )?;
            events.append(4, Vec::new())?;
        }
        let entry = fs::read_dir(dir.path())?
            .next()
            .ok_or_else(|| TrainingError::runtime("no event file written"))??;
        assert!(entry.file_name().to_string_lossy().ends_with(".run"));

        let events = read_records(&fs::read(entry.path())?);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].file_version.as_deref(), Some(FILE_VERSION));
        assert_eq!(events[1].step, 3);
        let values = &events[1].summary.as_ref().expect("summary").value;
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].tag, "train/loss_L1");
        assert_eq!(values[0].simple_value, Some(0.25));
        Ok(())
    }
}
