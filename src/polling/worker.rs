//! Polling workers: one task per polling group, either ticking on a fixed
//! interval (§4.6) or blocking on an external trigger (§4.7). Both modes
//! share the same per-cycle read-batch-then-emit logic; only their
//! scheduling differs.

use crate::config_store::{DataType, GroupConfig, TagConfig};
use crate::failure_log::{ErrorType, FailureEntry, FailureLogger};
use crate::mc3e::{grouper, DeviceAddress, McError, ReadValues};
use crate::metrics::{GROUP_POLL_DURATION, READINGS_POLLED};
use crate::plc::{ManagerError, PlcManager};
use crate::polling::status::{GroupState, StatusPublisher};
use crate::queue::DataQueueSender;
use crate::sample::{Quality, RawValue, Sample};
use chrono::Utc;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
enum Word {
    Bit(bool),
    Word(u16),
}

/// Result of one poll cycle: samples ready for the data queue, plus any
/// address runs that failed to read (spec §4.6 step 4: "for every address
/// in error_tags, build a failure log entry and skip sample emission").
pub struct PollOutcome {
    pub samples: Vec<Sample>,
    pub failed_addresses: Vec<DeviceAddress>,
    pub last_error: Option<McError>,
}

/// Read every tag in `group` in one cycle: group addresses into contiguous
/// runs (§4.3), read each run independently so one run's failure doesn't
/// invalidate another, then decode each tag's value out of whichever run(s)
/// covered it.
pub async fn poll_group_once(plc_manager: &PlcManager, group: &GroupConfig) -> PollOutcome {
    let all_addresses = expand_tag_addresses(&group.tags);
    let runs = grouper::group_addresses(&all_addresses);

    let mut values: HashMap<DeviceAddress, Word> = HashMap::new();
    let mut failed_addresses = Vec::new();
    let mut last_error = None;

    for run in &runs {
        match plc_manager.read_run(&group.plc_code, run).await {
            Ok(ReadValues::Words(words)) => {
                for (addr, w) in run.addresses().zip(words) {
                    values.insert(addr, Word::Word(w));
                }
            }
            Ok(ReadValues::Bits(bits)) => {
                for (addr, b) in run.addresses().zip(bits) {
                    values.insert(addr, Word::Bit(b));
                }
            }
            Err(err) => {
                failed_addresses.extend(run.addresses());
                last_error = Some(manager_error_to_mc(&err));
            }
        }
    }

    let mut samples = Vec::with_capacity(group.tags.len());
    for tag in &group.tags {
        match decode_tag(tag, &values) {
            Some(sample) => samples.push(sample),
            None => {
                if !failed_addresses.contains(&tag.address) {
                    failed_addresses.push(tag.address);
                }
            }
        }
    }

    PollOutcome {
        samples,
        failed_addresses,
        last_error,
    }
}

fn manager_error_to_mc(err: &ManagerError) -> McError {
    match err {
        ManagerError::Mc(e) => e.clone(),
        ManagerError::Inactive(code) => McError::Transport(format!("PLC {code} inactive")),
        ManagerError::NotRegistered(code) => McError::Transport(format!("PLC {code} not registered")),
    }
}

fn expand_tag_addresses(tags: &[TagConfig]) -> Vec<DeviceAddress> {
    let mut addresses = Vec::new();
    for tag in tags {
        let count = tag.data_type.word_count();
        for i in 0..count {
            addresses.push(DeviceAddress::new(tag.address.device, tag.address.offset + i as u32));
        }
    }
    addresses
}

fn decode_tag(tag: &TagConfig, values: &HashMap<DeviceAddress, Word>) -> Option<Sample> {
    let raw = match tag.data_type {
        DataType::Bit => match values.get(&tag.address)? {
            Word::Bit(b) => RawValue::Bit(*b),
            Word::Word(w) => RawValue::Bit(*w != 0),
        },
        DataType::Word => match values.get(&tag.address)? {
            Word::Word(w) => RawValue::Word(*w),
            Word::Bit(b) => RawValue::Word(if *b { 1 } else { 0 }),
        },
        DataType::DWord => {
            let lo = word_at(values, tag.address, 0)?;
            let hi = word_at(values, tag.address, 1)?;
            RawValue::DWord((hi as u32) << 16 | lo as u32)
        }
        DataType::Real => {
            let lo = word_at(values, tag.address, 0)?;
            let hi = word_at(values, tag.address, 1)?;
            let bits = (hi as u32) << 16 | lo as u32;
            RawValue::Real(f32::from_bits(bits))
        }
        DataType::Text { word_count } => {
            let mut bytes = Vec::with_capacity(word_count as usize * 2);
            for i in 0..word_count {
                let w = word_at(values, tag.address, i)?;
                bytes.push((w >> 8) as u8);
                bytes.push((w & 0xFF) as u8);
            }
            let text = String::from_utf8_lossy(&bytes).trim_end_matches('\0').to_string();
            RawValue::Text(text)
        }
    };

    Some(Sample::new(
        tag.plc_code.clone(),
        tag.address,
        &tag.machine_code,
        tag.kind,
        raw,
        tag.scale,
        Quality::Good,
    ))
}

fn word_at(values: &HashMap<DeviceAddress, Word>, base: DeviceAddress, offset: u32) -> Option<u16> {
    match values.get(&DeviceAddress::new(base.device, base.offset + offset))? {
        Word::Word(w) => Some(*w),
        Word::Bit(b) => Some(if *b { 1 } else { 0 }),
    }
}

/// Shared plumbing after a poll cycle completes: emit samples to the data
/// queue, write a failure log entry if anything failed, and update the
/// group's published status.
async fn finish_cycle(
    group_name: &str,
    plc_code: &str,
    outcome: PollOutcome,
    cycle_start: Instant,
    queue: &DataQueueSender,
    failure_logger: &FailureLogger,
    status: &mut StatusPublisher,
) {
    let elapsed = cycle_start.elapsed();
    let duration_ms = elapsed.as_secs_f64() * 1000.0;
    let now = Utc::now();

    GROUP_POLL_DURATION
        .with_label_values(&[group_name])
        .observe(elapsed.as_secs_f64());
    READINGS_POLLED
        .with_label_values(&[plc_code, group_name])
        .inc_by(outcome.samples.len() as f64);

    for sample in outcome.samples {
        if queue.put(sample).await.is_err() {
            warn!(group = group_name, "data queue full for 30s, failing this cycle");
            status.record_failure("data queue back-pressure timeout", duration_ms, now);
            log_failure(
                failure_logger,
                plc_code,
                group_name,
                ErrorType::CustomError,
                "data queue full for 30s",
                &[],
                duration_ms,
            )
            .await;
            return;
        }
    }

    if outcome.failed_addresses.is_empty() {
        status.record_success(duration_ms, now);
        return;
    }

    let message = outcome
        .last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "read failed".to_string());
    status.record_failure(message.clone(), duration_ms, now);

    let error_type = match message.contains("timed out") || message.contains("Timeout") {
        true => ErrorType::Timeout,
        false => ErrorType::ReadError,
    };
    log_failure(
        failure_logger,
        plc_code,
        group_name,
        error_type,
        &message,
        &outcome.failed_addresses,
        duration_ms,
    )
    .await;
}

async fn log_failure(
    logger: &FailureLogger,
    plc_code: &str,
    group_name: &str,
    error_type: ErrorType,
    message: &str,
    addresses: &[DeviceAddress],
    duration_ms: f64,
) {
    let entry = FailureEntry {
        timestamp: Utc::now(),
        plc_code: plc_code.to_string(),
        group_name: group_name.to_string(),
        error_type,
        error_message: message.to_string(),
        tag_addresses: addresses.iter().map(|a| a.to_string()).collect(),
        tag_count: addresses.len(),
        poll_duration_ms: duration_ms as u64,
        retry_count: 0,
        request: None,
        response: None,
    };
    if let Err(e) = logger.log(&entry).await {
        warn!(error = %e, "failed to write failure log entry");
    }
}

/// Run a Fixed-mode group to completion. Sleeps to on-grid ticks, skipping
/// any missed while a cycle overran (drift correction, spec §4.6): the next
/// tick is always the smallest `start + k*interval` strictly after now.
pub async fn run_fixed(
    group: GroupConfig,
    interval: Duration,
    plc_manager: &PlcManager,
    queue: DataQueueSender,
    failure_logger: &FailureLogger,
    mut status: StatusPublisher,
    cancel: CancellationToken,
) {
    status.set_state(GroupState::Running);
    let mut ticker = tokio::time::interval(interval);
    // A cycle that overran its tick skips straight to the next one rather
    // than bursting to catch up (spec §4.6 drift correction).
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => break,
        }

        let cycle_start = Instant::now();
        let outcome = poll_group_once(plc_manager, &group).await;
        finish_cycle(
            &group.name,
            &group.plc_code,
            outcome,
            cycle_start,
            &queue,
            failure_logger,
            &mut status,
        )
        .await;

        status.set_next_retry_at(Some(Utc::now() + chrono::Duration::milliseconds(interval.as_millis() as i64)));

        if cancel.is_cancelled() {
            break;
        }
    }
    status.set_state(GroupState::Idle);
    info!(group = %group.name, "fixed-mode worker stopped");
}

/// Handle for externally signalling a Handshake-mode worker. Non-coalescing
/// up to one queued trigger; triggers within 1s of the previous one are
/// dropped at the source (spec §4.7).
#[derive(Clone)]
pub struct TriggerHandle {
    tx: tokio::sync::mpsc::Sender<()>,
    last_trigger: std::sync::Arc<tokio::sync::Mutex<Option<Instant>>>,
}

const TRIGGER_DEDUP_WINDOW: Duration = Duration::from_secs(1);

impl TriggerHandle {
    /// Attempt to trigger a poll. Returns `false` if the trigger was
    /// deduplicated (within 1s of the last one) or dropped because one is
    /// already queued.
    pub async fn trigger(&self) -> bool {
        {
            let mut last = self.last_trigger.lock().await;
            let now = Instant::now();
            if let Some(prev) = *last {
                if now.duration_since(prev) < TRIGGER_DEDUP_WINDOW {
                    debug!("trigger deduplicated (within 1s of previous)");
                    return false;
                }
            }
            *last = Some(now);
        }
        self.tx.try_send(()).is_ok()
    }
}

pub fn trigger_channel() -> (TriggerHandle, tokio::sync::mpsc::Receiver<()>) {
    let (tx, rx) = tokio::sync::mpsc::channel(1);
    (
        TriggerHandle {
            tx,
            last_trigger: std::sync::Arc::new(tokio::sync::Mutex::new(None)),
        },
        rx,
    )
}

/// Run a Handshake-mode group to completion, blocking on `triggers` between
/// cycles.
pub async fn run_handshake(
    group: GroupConfig,
    mut triggers: tokio::sync::mpsc::Receiver<()>,
    plc_manager: &PlcManager,
    queue: DataQueueSender,
    failure_logger: &FailureLogger,
    mut status: StatusPublisher,
    cancel: CancellationToken,
) {
    status.set_state(GroupState::Running);
    let trigger_address = group.trigger_address;

    loop {
        tokio::select! {
            trigger = triggers.recv() => {
                if trigger.is_none() {
                    break;
                }
            }
            _ = cancel.cancelled() => break,
        }

        let cycle_start = Instant::now();
        let outcome = poll_group_once(plc_manager, &group).await;
        finish_cycle(
            &group.name,
            &group.plc_code,
            outcome,
            cycle_start,
            &queue,
            failure_logger,
            &mut status,
        )
        .await;

        if group.auto_reset_trigger {
            if let Some(addr) = trigger_address {
                // Always a separate round trip after the read batch commits,
                // never folded into the read frame (spec §9 open question).
                if let Err(e) = plc_manager.write_word(&group.plc_code, addr, 0).await {
                    warn!(group = %group.name, error = %e, "failed to write trigger-reset back to PLC");
                }
            }
        }

        if cancel.is_cancelled() {
            break;
        }
    }
    status.set_state(GroupState::Idle);
    info!(group = %group.name, "handshake-mode worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mc3e::DeviceCode;
    use crate::sample::TagKind;

    fn word_tag(offset: u32) -> TagConfig {
        TagConfig {
            plc_code: "PLC01".to_string(),
            address: DeviceAddress::new(DeviceCode::D, offset),
            data_type: DataType::Word,
            kind: TagKind::WordHost,
            scale: 1.0,
            unit: None,
            machine_code: "EQUIP0000000001".to_string(),
            group_name: Some("G1".to_string()),
        }
    }

    #[test]
    fn decode_word_tag_from_values_map() {
        let tag = word_tag(100);
        let mut values = HashMap::new();
        values.insert(tag.address, Word::Word(42));
        let sample = decode_tag(&tag, &values).unwrap();
        assert_eq!(sample.scaled_value, 42.0);
    }

    #[test]
    fn decode_dword_tag_combines_two_words() {
        let mut tag = word_tag(100);
        tag.data_type = DataType::DWord;
        let mut values = HashMap::new();
        values.insert(DeviceAddress::new(DeviceCode::D, 100), Word::Word(0x1234));
        values.insert(DeviceAddress::new(DeviceCode::D, 101), Word::Word(0x0001));
        let sample = decode_tag(&tag, &values).unwrap();
        assert_eq!(sample.scaled_value, 0x00011234 as f64);
    }

    #[test]
    fn decode_returns_none_when_value_missing() {
        let tag = word_tag(100);
        let values = HashMap::new();
        assert!(decode_tag(&tag, &values).is_none());
    }

    #[test]
    fn expand_addresses_accounts_for_multi_word_types() {
        let mut tags = vec![word_tag(100)];
        tags[0].data_type = DataType::DWord;
        let addresses = expand_tag_addresses(&tags);
        assert_eq!(addresses, vec![
            DeviceAddress::new(DeviceCode::D, 100),
            DeviceAddress::new(DeviceCode::D, 101),
        ]);
    }

    #[tokio::test]
    async fn trigger_within_one_second_is_deduplicated() {
        let (handle, mut rx) = trigger_channel();
        assert!(handle.trigger().await);
        assert!(!handle.trigger().await);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
