//! Recognition stage.
//!
//! Idle while the recognition window is closed: stale candidates and frames
//! are discarded and no detection runs. Active while it is open: each sampled
//! frame goes through detection, cropping, OCR and the plate grammar, and
//! accepted plates are queued as candidates for the validation gateway.

use anyhow::Result;
use std::time::Duration;

use crate::detect::PlateDetector;
use crate::frame::Frame;
use crate::ocr::TextRecognizer;
use crate::plate::PlateGrammar;
use crate::queue::{EvictingQueue, FrameSlot};
use crate::signal::{RecognitionWindow, StopSignal};

const IDLE_POLL: Duration = Duration::from_millis(50);
const FRAME_WAIT: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Idle,
    Active,
}

pub struct RecognitionStage {
    detector: Box<dyn PlateDetector>,
    recognizer: Box<dyn TextRecognizer>,
    grammar: PlateGrammar,
    window: RecognitionWindow,
    frames: FrameSlot<Frame>,
    candidates: EvictingQueue<String>,
    stop: StopSignal,
}

impl RecognitionStage {
    pub fn new(
        detector: Box<dyn PlateDetector>,
        recognizer: Box<dyn TextRecognizer>,
        grammar: PlateGrammar,
        window: RecognitionWindow,
        frames: FrameSlot<Frame>,
        candidates: EvictingQueue<String>,
        stop: StopSignal,
    ) -> Self {
        Self {
            detector,
            recognizer,
            grammar,
            window,
            frames,
            candidates,
            stop,
        }
    }

    pub fn run(mut self) -> Result<()> {
        if let Err(err) = self.detector.warm_up() {
            log::warn!("{} detector warm-up failed: {:#}", self.detector.name(), err);
        }
        log::info!(
            "plate recognition is running ({} detector, grammar {})",
            self.detector.name(),
            self.grammar
        );

        let mut state = State::Idle;
        while !self.stop.is_stopped() {
            let next = if self.window.is_active() {
                State::Active
            } else {
                State::Idle
            };
            if next != state {
                log::debug!(
                    "recognition {:?} -> {:?} (gate {:?})",
                    state,
                    next,
                    self.window.gate_position()
                );
                state = next;
            }

            match state {
                State::Idle => {
                    let stale = self.candidates.drain().len();
                    if stale > 0 {
                        log::debug!("discarded {} stale plate candidates", stale);
                    }
                    self.frames.drain();
                    std::thread::sleep(IDLE_POLL);
                }
                State::Active => {
                    let Some(frame) = self.frames.recv_timeout(FRAME_WAIT) else {
                        continue;
                    };
                    match self.process_frame(&frame) {
                        Ok(plates) => {
                            for plate in plates {
                                log::info!(
                                    "plate candidate {} (frame {}, gate {:?})",
                                    plate,
                                    frame.ordinal,
                                    self.window.gate_position()
                                );
                                self.candidates.push(plate);
                            }
                        }
                        Err(err) => {
                            log::warn!("recognition failed on frame {}: {:#}", frame.ordinal, err);
                        }
                    }
                }
            }
        }
        log::info!("plate recognition is stopped");
        Ok(())
    }

    /// Plates accepted by the grammar in `frame`, at most one per detected
    /// region. A failing crop is logged and skipped; a failing detector
    /// fails the frame.
    pub fn process_frame(&mut self, frame: &Frame) -> Result<Vec<String>> {
        let boxes = self.detector.detect(frame)?;
        let mut plates = Vec::new();
        for plate_box in boxes {
            let Some(rect) = plate_box.crop_rect(frame.width, frame.height) else {
                continue;
            };
            let crop = frame.crop(&rect)?;
            let readings = match self.recognizer.recognize_text(&crop) {
                Ok(readings) => readings,
                Err(err) => {
                    log::warn!(
                        "text recognition failed on frame {} region {:?}: {:#}",
                        frame.ordinal,
                        rect,
                        err
                    );
                    continue;
                }
            };
            let accepted = readings
                .iter()
                .find_map(|reading| self.grammar.normalize(&reading.text));
            match accepted {
                Some(plate) => plates.push(plate),
                None if !readings.is_empty() => log::debug!(
                    "no plate in readings {:?} (frame {})",
                    readings.iter().map(|r| r.text.as_str()).collect::<Vec<_>>(),
                    frame.ordinal
                ),
                None => {}
            }
        }
        Ok(plates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{PlateBox, ScriptedDetector, WholeFrameDetector};
    use crate::ocr::ScriptedRecognizer;
    use crate::queue::frame_slot;

    fn frame(ordinal: u64) -> Frame {
        Frame::new(vec![0; 20 * 10 * 3], 20, 10, ordinal).unwrap()
    }

    struct Harness {
        window: RecognitionWindow,
        frames: FrameSlot<Frame>,
        candidates: EvictingQueue<String>,
        stop: StopSignal,
        ocr: ScriptedRecognizer,
        detector: ScriptedDetector,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                window: RecognitionWindow::new(),
                frames: frame_slot(),
                candidates: EvictingQueue::new(100),
                stop: StopSignal::new(),
                ocr: ScriptedRecognizer::new(),
                detector: ScriptedDetector::new(),
            }
        }

        fn stage(&self) -> RecognitionStage {
            RecognitionStage::new(
                Box::new(self.detector.clone()),
                Box::new(self.ocr.clone()),
                PlateGrammar::default(),
                self.window.clone(),
                self.frames.clone(),
                self.candidates.clone(),
                self.stop.clone(),
            )
        }
    }

    #[test]
    fn first_grammatical_reading_per_crop_wins() {
        let harness = Harness::new();
        let mut stage = harness.stage();
        harness.ocr.push_texts(&["GATE 7", "12O34567", "12A34567"]);
        assert_eq!(stage.process_frame(&frame(1)).unwrap(), vec!["12O34567"]);
    }

    #[test]
    fn each_region_yields_at_most_one_plate() {
        let harness = Harness::new();
        let mut stage = harness.stage();
        harness.detector.push_boxes(vec![
            PlateBox::new(0.0, 0.0, 10.0, 10.0, 0.9, 0),
            PlateBox::new(10.0, 0.0, 10.0, 10.0, 0.8, 0),
            PlateBox::new(500.0, 500.0, 10.0, 10.0, 0.7, 0),
        ]);
        harness.ocr.push_texts(&["12A34567"]);
        harness.ocr.push_failure("engine crashed");
        assert_eq!(stage.process_frame(&frame(1)).unwrap(), vec!["12A34567"]);
        // The off-frame region never reached OCR.
        assert_eq!(harness.ocr.calls(), 2);
    }

    #[test]
    fn detector_failure_fails_only_that_frame() {
        let harness = Harness::new();
        let mut stage = harness.stage();
        harness.detector.push_failure("model exploded");
        assert!(stage.process_frame(&frame(1)).is_err());
        harness.ocr.push_texts(&["12-A 345.67"]);
        assert_eq!(stage.process_frame(&frame(2)).unwrap(), vec!["12A34567"]);
    }

    #[test]
    fn idle_stage_does_no_work_and_discards_stale_state() {
        let harness = Harness::new();
        harness.candidates.push("99A99999".to_string());
        harness.frames.push(frame(1));
        harness.ocr.push_texts(&["12A34567"]);
        let stop = harness.stop.clone();
        let stage = harness.stage();
        let handle = std::thread::spawn(move || stage.run());

        std::thread::sleep(Duration::from_millis(200));
        assert!(harness.candidates.is_empty());
        assert!(harness.frames.is_empty());
        assert_eq!(harness.ocr.calls(), 0);

        stop.stop();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn active_stage_queues_candidates_and_survives_failures() {
        let harness = Harness::new();
        harness.ocr.push_failure("engine crashed");
        harness.ocr.push_texts(&["12A34567"]);
        let stop = harness.stop.clone();
        let stage = RecognitionStage::new(
            Box::new(WholeFrameDetector::new()),
            Box::new(harness.ocr.clone()),
            PlateGrammar::default(),
            harness.window.clone(),
            harness.frames.clone(),
            harness.candidates.clone(),
            harness.stop.clone(),
        );
        let handle = std::thread::spawn(move || stage.run());

        let _guard = harness.window.activate(Some("north"));
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        let mut ordinal = 0;
        let mut plate = None;
        while plate.is_none() && std::time::Instant::now() < deadline {
            ordinal += 1;
            harness.frames.push(frame(ordinal));
            plate = harness.candidates.recv_timeout(Duration::from_millis(50));
        }
        assert!(harness.ocr.calls() >= 2);
        assert_eq!(plate.as_deref(), Some("12A34567"));

        stop.stop();
        handle.join().unwrap().unwrap();
    }
}
