//! The capture loop: frame → detect → recognize → throttle → ledger / snapshot.

use crate::ledger::{AttendanceLedger, AttendanceRecord, LedgerError, RecordOutcome};
use crate::policy::{Decision, Subject, ThrottlePolicy};
use crate::sink::{SinkError, UnknownFaceSink};
use chrono::{Local, NaiveDateTime};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use rollcall_core::{Config, DetectorCascade, FaceRegion, FaceSize, Identity, IdentityGallery, Recognition, Recognizer};
use rollcall_hw::{CameraError, Frame, FrameSource};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

const KNOWN_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("unknown-face sink error: {0}")]
    Sink(#[from] SinkError),
}

/// Source of local wall-clock time. Read once per frame.
pub trait Clock {
    fn now(&self) -> NaiveDateTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// What happened while processing one frame.
#[derive(Debug, Default)]
pub struct FrameReport {
    pub faces: usize,
    pub recorded: Vec<AttendanceRecord>,
    pub unknown_snapshots: Vec<PathBuf>,
}

/// Totals over a whole run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub frames: u64,
    pub faces: u64,
    pub recorded: u64,
    pub unknown_captured: u64,
}

pub struct Pipeline<C: Clock> {
    detectors: DetectorCascade,
    recognizer: Box<dyn Recognizer + Send>,
    gallery: IdentityGallery,
    ledger: AttendanceLedger,
    sink: UnknownFaceSink,
    policy: ThrottlePolicy,
    face_size: FaceSize,
    threshold: f64,
    clock: C,
}

impl<C: Clock> Pipeline<C> {
    /// Assemble the pipeline. Creates the attendance and unknown-face directories.
    pub fn new(
        config: &Config,
        detectors: DetectorCascade,
        recognizer: Box<dyn Recognizer + Send>,
        gallery: IdentityGallery,
        clock: C,
    ) -> Result<Self, PipelineError> {
        let ledger = AttendanceLedger::open(&config.attendance_dir(), config.office_start)?;
        let today = clock.now().date();
        tracing::info!(
            dir = %config.attendance_dir().display(),
            present_today = ledger.records(today)?.len(),
            identities = gallery.len(),
            "attendance ledger ready"
        );

        Ok(Self {
            detectors,
            recognizer,
            gallery,
            ledger,
            sink: UnknownFaceSink::open(&config.unknown_dir())?,
            policy: ThrottlePolicy::new(config.debounce_window()),
            face_size: config.face_size,
            threshold: config.confidence_threshold,
            clock,
        })
    }

    /// Pull frames until `quit` is raised or the source fails.
    ///
    /// `quit` is checked after each frame; a read failure ends the run with
    /// an error.
    pub fn run(&mut self, source: &mut dyn FrameSource, quit: &AtomicBool) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary::default();
        loop {
            let mut frame = source.next_frame()?;
            let report = self.process_frame(&mut frame)?;

            summary.frames += 1;
            summary.faces += report.faces as u64;
            summary.recorded += report.recorded.len() as u64;
            summary.unknown_captured += report.unknown_snapshots.len() as u64;

            if quit.load(Ordering::SeqCst) {
                tracing::info!(frames = summary.frames, "quit requested; stopping capture loop");
                return Ok(summary);
            }
        }
    }

    /// Detect, recognize and act on every face in `frame`, outlining each
    /// region on the colour buffer.
    ///
    /// All regions are outlined before any face is acted on, so a snapshot
    /// shows every face in the frame.
    pub fn process_frame(&mut self, frame: &mut Frame) -> Result<FrameReport, PipelineError> {
        let now = self.clock.now();
        let regions = self.detectors.detect(&frame.gray);
        let mut report = FrameReport {
            faces: regions.len(),
            ..FrameReport::default()
        };

        let mut faces: Vec<(Option<Identity>, f64)> = Vec::with_capacity(regions.len());
        for region in regions {
            let Some(region) = region.clamp_to(frame.width(), frame.height()) else {
                continue;
            };

            let crop = imageops::crop_imm(&frame.gray, region.x, region.y, region.width, region.height).to_image();
            let face = imageops::resize(&crop, self.face_size.width, self.face_size.height, FilterType::Triangle);
            let result = self.recognizer.predict(&face);

            let known: Option<Identity> = match self.gallery.classify(&result, self.threshold) {
                Recognition::Known(identity) => Some(identity.clone()),
                Recognition::Unknown => None,
            };
            outline(&mut frame.color, region, known.is_some());
            faces.push((known, result.confidence));
        }

        for (known, confidence) in faces {
            match known {
                Some(identity) => {
                    tracing::trace!(name = %identity.name, confidence, "face recognized");
                    if let Some(record) = self.on_known(&identity, now)? {
                        report.recorded.push(record);
                    }
                }
                None => {
                    tracing::trace!(confidence, "face not recognized");
                    if let Some(path) = self.on_unknown(&frame.color, now) {
                        report.unknown_snapshots.push(path);
                    }
                }
            }
        }

        Ok(report)
    }

    fn on_known(&mut self, identity: &Identity, now: NaiveDateTime) -> Result<Option<AttendanceRecord>, PipelineError> {
        let already = self.ledger.contains(&identity.name, now.date())?;
        match self.policy.on_known(identity.id, already, now) {
            Decision::Skip(reason) => {
                tracing::debug!(name = %identity.name, ?reason, "attendance skipped");
                Ok(None)
            }
            Decision::Act => match self.ledger.record(&identity.name, now.date(), now.time())? {
                RecordOutcome::Recorded(record) => {
                    self.policy.mark(Subject::Known(identity.id), now);
                    Ok(Some(record))
                }
                RecordOutcome::AlreadyPresent => Ok(None),
            },
        }
    }

    /// A failed snapshot is logged, and still counts as the action for throttling.
    fn on_unknown(&mut self, color: &RgbImage, now: NaiveDateTime) -> Option<PathBuf> {
        match self.policy.on_unknown(now) {
            Decision::Skip(reason) => {
                tracing::debug!(?reason, "unknown face skipped");
                None
            }
            Decision::Act => {
                self.policy.mark(Subject::Unknown, now);
                match self.sink.capture(color, now) {
                    Ok(path) => Some(path),
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to save unknown face");
                        None
                    }
                }
            }
        }
    }
}

/// Two-pixel outline, green for a recognized face, red otherwise.
fn outline(canvas: &mut RgbImage, region: FaceRegion, known: bool) {
    let color = if known { KNOWN_COLOR } else { UNKNOWN_COLOR };
    let (x, y) = (region.x as i32, region.y as i32);
    draw_hollow_rect_mut(canvas, Rect::at(x, y).of_size(region.width, region.height), color);
    if region.width > 2 && region.height > 2 {
        draw_hollow_rect_mut(canvas, Rect::at(x + 1, y + 1).of_size(region.width - 2, region.height - 2), color);
    }
}
