//! Batch Ingestion Module
//!
//! Walks the vertical and horizontal source folders of a work folder and
//! drives every file through parsing, sheet/row resolution, frame capture
//! and placement. Videos are all processed before any defect photo group.

use indexmap::IndexMap;
use log::{debug, info, warn};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{IngestError, Result};
use crate::frames::{CaptureDir, FrameExtractor};
use crate::parser::{self, MediaKind, ParsedRecord, PipeKind, RowKey};
use crate::placement::{self, PlacementOutcome};
use crate::report::{self, SheetCache};
use crate::workbook::Workbook;

/// Number of stills a video must yield before it is placed.
const REQUIRED_FRAMES: usize = 3;

/// Progress notification sent after each input file.
#[derive(Debug, Clone, Copy)]
pub struct Progress<'a> {
    pub processed: usize,
    pub total: usize,
    pub file: &'a str,
}

pub type ProgressSink = Box<dyn FnMut(&Progress<'_>)>;

/// Capabilities the caller hands to a run: where progress goes, how to ask
/// for cancellation, and optionally what total to report against.
pub struct RunHooks {
    pub progress: Option<ProgressSink>,
    pub cancel: Arc<AtomicBool>,
    pub total_override: Option<usize>,
}

impl Default for RunHooks {
    fn default() -> Self {
        Self {
            progress: None,
            cancel: Arc::new(AtomicBool::new(false)),
            total_override: None,
        }
    }
}

impl RunHooks {
    pub fn with_progress(mut self, sink: impl FnMut(&Progress<'_>) + 'static) -> Self {
        self.progress = Some(Box::new(sink));
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_total(mut self, total: usize) -> Self {
        self.total_override = Some(total);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Counters describing one run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total_files: usize,
    pub processed_files: usize,
    pub videos_placed: usize,
    pub image_groups_placed: usize,
    pub images_inserted: usize,
    pub parse_failures: usize,
    pub capture_failures: usize,
    pub skipped: usize,
    pub placement_failures: usize,
    pub sheets_created: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
struct SourceFile {
    pipe_kind: PipeKind,
    name: String,
    path: PathBuf,
}

/// Defect photos sharing a row key; only the first is written.
#[derive(Debug)]
struct ImageGroup {
    record: ParsedRecord,
    files: Vec<SourceFile>,
}

/// Everything found in the source folders, in processing order.
#[derive(Debug, Default)]
struct BatchPlan {
    videos: Vec<SourceFile>,
    unparsed_images: Vec<(SourceFile, IngestError)>,
    image_groups: IndexMap<(PipeKind, RowKey), ImageGroup>,
}

impl BatchPlan {
    fn file_count(&self) -> usize {
        self.videos.len()
            + self.unparsed_images.len()
            + self.image_groups.values().map(|g| g.files.len()).sum::<usize>()
    }
}

/// Lists a source folder in filesystem order, keeping only the files the
/// pipeline handles.
fn list_sources(folder: &Path, pipe_kind: PipeKind) -> Result<Vec<(SourceFile, MediaKind)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(folder)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            warn!("Skipping non UTF-8 filename {:?}", entry.file_name());
            continue;
        };
        if let Some(kind) = parser::classify(&name) {
            files.push((
                SourceFile {
                    pipe_kind,
                    name,
                    path: entry.path(),
                },
                kind,
            ));
        }
    }
    Ok(files)
}

fn plan_batch(work_dir: &Path) -> BatchPlan {
    let mut plan = BatchPlan::default();
    for pipe_kind in PipeKind::ALL {
        let folder = work_dir.join(pipe_kind.folder_name());
        if !folder.is_dir() {
            warn!("Folder not found: {:?}", folder);
            continue;
        }
        let files = match list_sources(&folder, pipe_kind) {
            Ok(files) => files,
            Err(e) => {
                warn!("Could not list {:?}: {}", folder, e);
                continue;
            }
        };
        for (file, kind) in files {
            match kind {
                MediaKind::Video => plan.videos.push(file),
                MediaKind::Image => match parser::parse_image(&file.name, pipe_kind) {
                    Ok(record) => {
                        let key = (pipe_kind, record.row_key());
                        plan.image_groups
                            .entry(key)
                            .or_insert_with(|| ImageGroup {
                                record,
                                files: Vec::new(),
                            })
                            .files
                            .push(file);
                    }
                    Err(e) => plan.unparsed_images.push((file, e)),
                },
            }
        }
    }
    plan
}

/// Single-threaded driver of one ingestion run over a borrowed workbook.
pub struct Ingestor<'a, E: FrameExtractor> {
    workbook: &'a mut Workbook,
    extractor: E,
    hooks: RunHooks,
    captures: &'a mut CaptureDir,
    sheets: SheetCache,
    summary: RunSummary,
}

impl<'a, E: FrameExtractor> Ingestor<'a, E> {
    pub fn new(
        workbook: &'a mut Workbook,
        extractor: E,
        hooks: RunHooks,
        captures: &'a mut CaptureDir,
    ) -> Self {
        Self {
            workbook,
            extractor,
            hooks,
            captures,
            sheets: SheetCache::new(),
            summary: RunSummary::default(),
        }
    }

    /// Both template sheets must exist before anything is processed.
    pub fn check_templates(&self) -> Result<()> {
        for pipe_kind in PipeKind::ALL {
            let template = pipe_kind.template_sheet();
            if !self.workbook.has_sheet(&template) {
                return Err(IngestError::MissingTemplate(template));
            }
        }
        Ok(())
    }

    /// Processes the work folder. Per-file errors are logged and counted;
    /// only a missing template ends the run with an error. A cancelled run
    /// returns normally with `cancelled` set.
    pub fn run(&mut self, work_dir: &Path) -> Result<RunSummary> {
        self.sheets.clear();
        self.summary = RunSummary::default();
        self.check_templates()?;

        let plan = plan_batch(work_dir);
        self.summary.total_files = self.hooks.total_override.unwrap_or(plan.file_count());
        info!(
            "Found {} files: {} videos, {} photo groups",
            plan.file_count(),
            plan.videos.len(),
            plan.image_groups.len()
        );

        for file in &plan.videos {
            if self.stop_requested() {
                return Ok(self.finish());
            }
            let result = self.process_video(file);
            self.settle(file, result, |s| s.videos_placed += 1)?;
            self.advance(&file.name);
        }

        for (file, err) in plan.unparsed_images {
            if self.stop_requested() {
                return Ok(self.finish());
            }
            self.settle(&file, Err(err), |_| {})?;
            self.advance(&file.name);
        }

        for group in plan.image_groups.values() {
            if self.stop_requested() {
                return Ok(self.finish());
            }
            let Some(first) = group.files.first() else {
                continue;
            };
            info!(
                "Processing photo {} (first of {})",
                first.name,
                group.files.len()
            );
            let result = self.process_image_group(group);
            self.settle(first, result, |s| s.image_groups_placed += 1)?;
            self.advance(&first.name);
            for duplicate in &group.files[1..] {
                debug!("{} shares its row with {}, not placed", duplicate.name, first.name);
                self.advance(&duplicate.name);
            }
        }

        Ok(self.finish())
    }

    fn process_video(&mut self, file: &SourceFile) -> Result<()> {
        let record = parser::parse_video(&file.name, file.pipe_kind)?;
        let complex = record.complex()?;
        info!("Processing video {}", file.name);

        let sheet_id = self.sheets.resolve(self.workbook, complex, file.pipe_kind)?;
        let row = report::resolve_row(self.workbook.sheet_mut(sheet_id), &record)?;

        let capture_dir = self.captures.ensure()?;
        let frames = self.extractor.extract(&file.path, capture_dir)?;
        self.captures.track(&frames);
        if frames.len() < REQUIRED_FRAMES {
            return Err(IngestError::Extraction {
                video: file.path.clone(),
                reason: format!("only {} of {} frames captured", frames.len(), REQUIRED_FRAMES),
            });
        }

        let sheet = self.workbook.sheet_mut(sheet_id);
        let outcome = placement::place_video_frames(sheet, file.pipe_kind, &frames, row);
        self.tally(outcome);
        Ok(())
    }

    fn process_image_group(&mut self, group: &ImageGroup) -> Result<()> {
        let Some(first) = group.files.first() else {
            return Ok(());
        };
        let complex = group.record.complex()?;
        let sheet_id = self.sheets.resolve(self.workbook, complex, first.pipe_kind)?;
        let sheet = self.workbook.sheet_mut(sheet_id);
        let row = report::resolve_row(sheet, &group.record)?;

        let outcome = placement::place_defect_photo(
            sheet,
            &first.path,
            &group.record,
            row,
            group.files.len(),
        );
        self.tally(outcome);
        Ok(())
    }

    fn tally(&mut self, outcome: PlacementOutcome) {
        self.summary.images_inserted += outcome.images;
        self.summary.placement_failures += outcome.failures;
    }

    /// Books the result of one file. Fatal errors are passed up; everything
    /// else is logged and counted.
    fn settle(
        &mut self,
        file: &SourceFile,
        result: Result<()>,
        on_success: impl FnOnce(&mut RunSummary),
    ) -> Result<()> {
        let position = format!("[{}/{}]", self.summary.processed_files + 1, self.summary.total_files);
        match result {
            Ok(()) => {
                on_success(&mut self.summary);
                info!("{} {} done", position, file.name);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                if e.is_parse_failure() {
                    self.summary.parse_failures += 1;
                } else if matches!(e, IngestError::Extraction { .. }) {
                    self.summary.capture_failures += 1;
                } else {
                    self.summary.skipped += 1;
                }
                warn!("{} {} skipped: {}", position, file.name, e);
                Ok(())
            }
        }
    }

    fn advance(&mut self, file: &str) {
        self.summary.processed_files += 1;
        if let Some(sink) = self.hooks.progress.as_mut() {
            sink(&Progress {
                processed: self.summary.processed_files,
                total: self.summary.total_files,
                file,
            });
        }
    }

    fn stop_requested(&mut self) -> bool {
        if self.hooks.is_cancelled() {
            info!(
                "Processing cancelled after {} of {} files",
                self.summary.processed_files, self.summary.total_files
            );
            self.summary.cancelled = true;
        }
        self.summary.cancelled
    }

    fn finish(&mut self) -> RunSummary {
        self.summary.sheets_created = self.sheets.created();
        self.summary.clone()
    }

    /// Summary of the most recent run, including a partial one.
    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{capture_file_name, CAPTURE_SUFFIXES};
    use crate::placement::tests::write_test_jpeg;
    use crate::report::tests::template_workbook;
    use crate::report::HEADER_ROW;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Writes `frames` small JPEG stills per video instead of decoding.
    struct FakeExtractor {
        frames: usize,
        calls: Vec<PathBuf>,
    }

    impl FakeExtractor {
        fn new(frames: usize) -> Self {
            Self {
                frames,
                calls: Vec::new(),
            }
        }
    }

    impl FrameExtractor for FakeExtractor {
        fn extract(&mut self, video: &Path, capture_dir: &Path) -> Result<Vec<PathBuf>> {
            self.calls.push(video.to_path_buf());
            Ok(CAPTURE_SUFFIXES
                .iter()
                .take(self.frames)
                .map(|suffix| {
                    let path = capture_dir.join(capture_file_name(video, suffix));
                    write_test_jpeg(&path);
                    path
                })
                .collect())
        }
    }

    struct Fixture {
        root: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            for kind in PipeKind::ALL {
                fs::create_dir_all(root.path().join(kind.folder_name())).unwrap();
            }
            Self { root }
        }

        fn work_dir(&self) -> &Path {
            self.root.path()
        }

        fn capture_dir(&self) -> CaptureDir {
            CaptureDir::new(self.root.path().join("captured_images"))
        }

        fn video(&self, kind: PipeKind, name: &str) {
            fs::write(self.root.path().join(kind.folder_name()).join(name), b"").unwrap();
        }

        fn photo(&self, kind: PipeKind, name: &str) {
            write_test_jpeg(&self.root.path().join(kind.folder_name()).join(name));
        }
    }

    fn run_with(
        fixture: &Fixture,
        workbook: &mut Workbook,
        extractor: &mut FakeExtractor,
        hooks: RunHooks,
    ) -> Result<RunSummary> {
        let mut captures = fixture.capture_dir();
        let mut ingestor = Ingestor::new(workbook, extractor, hooks, &mut captures);
        ingestor.run(fixture.work_dir())
    }

    #[test]
    fn vertical_video_creates_sheet_row_and_three_images() {
        let fixture = Fixture::new();
        fixture.video(PipeKind::Vertical, "1102동 4호 입상관 세탁.mp4");
        let mut workbook = template_workbook();
        let mut extractor = FakeExtractor::new(3);

        let summary =
            run_with(&fixture, &mut workbook, &mut extractor, RunHooks::default()).unwrap();
        assert_eq!(summary.videos_placed, 1);
        assert_eq!(summary.images_inserted, 3);
        assert_eq!(summary.sheets_created, 1);

        let id = workbook.find_sheet("점검결과사진(입상)_11단지").unwrap();
        let sheet = workbook.sheet(id);
        let row = HEADER_ROW + 1;
        assert_eq!(sheet.cell_text(row, 1), "1102동");
        assert_eq!(sheet.cell_text(row, 2), "4호");
        assert_eq!(sheet.cell_text(row, 3), "세탁");
        assert_eq!(sheet.images().len(), 3);
        assert!(!fixture.root.path().join("captured_images").exists());
    }

    #[test]
    fn horizontal_video_uses_its_own_sheet() {
        let fixture = Fixture::new();
        fixture.video(PipeKind::Horizontal, "901동 1-1호 횡주관 배수(이상배관).mp4");
        let mut workbook = template_workbook();
        let mut extractor = FakeExtractor::new(3);

        run_with(&fixture, &mut workbook, &mut extractor, RunHooks::default()).unwrap();
        let id = workbook.find_sheet("점검결과사진(횡주)_9단지").unwrap();
        let sheet = workbook.sheet(id);
        assert_eq!(sheet.cell_text(HEADER_ROW + 1, 3), "1-1");
        assert!(sheet.image_at(HEADER_ROW + 1, 7).is_some());
        assert!(sheet.image_at(HEADER_ROW + 1, 8).is_some());
    }

    #[test]
    fn duplicate_defect_photos_write_once_with_count() {
        let fixture = Fixture::new();
        for name in [
            "1102동 4호 입상관 세탁_이물질_옥상.jpg",
            "1102동 4호 입상관 세탁_이물질_옥상2.jpg",
            "1102동 4호 입상관 세탁_누수_1층.png",
        ] {
            fixture.photo(PipeKind::Vertical, name);
        }
        let mut workbook = template_workbook();
        let mut extractor = FakeExtractor::new(3);

        let summary =
            run_with(&fixture, &mut workbook, &mut extractor, RunHooks::default()).unwrap();
        assert_eq!(summary.image_groups_placed, 1);
        assert_eq!(summary.images_inserted, 1);
        assert_eq!(summary.processed_files, 3);

        let id = workbook.find_sheet("점검결과사진(입상)_11단지").unwrap();
        let sheet = workbook.sheet(id);
        assert_eq!(sheet.images().len(), 1);
        assert!(sheet.cell_text(HEADER_ROW + 1, 10).ends_with("(3)"));
    }

    #[test]
    fn video_and_photo_of_same_key_share_a_row() {
        let fixture = Fixture::new();
        fixture.photo(PipeKind::Vertical, "1102동 4호 입상관 세탁_이물질_옥상.jpg");
        fixture.video(PipeKind::Vertical, "1102동 4호 입상관 세탁.mp4");
        let mut workbook = template_workbook();
        let mut extractor = FakeExtractor::new(3);

        run_with(&fixture, &mut workbook, &mut extractor, RunHooks::default()).unwrap();
        let id = workbook.find_sheet("점검결과사진(입상)_11단지").unwrap();
        let sheet = workbook.sheet(id);
        assert_eq!(sheet.max_row(), HEADER_ROW + 1);
        assert_eq!(sheet.images().len(), 4);
        assert_eq!(sheet.cell_text(HEADER_ROW + 1, 10), "옥상");
    }

    #[test]
    fn cancellation_stops_before_the_next_file() {
        let fixture = Fixture::new();
        for unit in 1..=5 {
            fixture.video(PipeKind::Vertical, &format!("1102동 {unit}호 입상관 세탁.mp4"));
        }
        let mut workbook = template_workbook();
        let mut extractor = FakeExtractor::new(3);

        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        let hooks = RunHooks::default()
            .with_cancel(cancel)
            .with_progress(move |p| {
                if p.processed == 2 {
                    flag.store(true, Ordering::SeqCst);
                }
            });

        let summary = run_with(&fixture, &mut workbook, &mut extractor, hooks).unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.processed_files, 2);
        assert_eq!(summary.videos_placed, 2);
        assert_eq!(extractor.calls.len(), 2);

        let id = workbook.find_sheet("점검결과사진(입상)_11단지").unwrap();
        let sheet = workbook.sheet(id);
        assert_eq!(sheet.max_row(), HEADER_ROW + 2);
        assert_eq!(sheet.images().len(), 6);
    }

    #[test]
    fn per_file_failures_do_not_stop_the_batch() {
        let fixture = Fixture::new();
        fixture.video(PipeKind::Vertical, "잘못된 이름.mp4");
        fixture.video(PipeKind::Vertical, "99999999999동 4호 입상관 세탁.mp4");
        fixture.video(PipeKind::Vertical, "1102동 4호 입상관 세탁.mp4");
        fixture.photo(PipeKind::Vertical, "1102동 4호 입상관 세탁.jpg");
        fs::write(fixture.root.path().join("입상관").join("notes.txt"), b"x").unwrap();
        let mut workbook = template_workbook();
        let mut extractor = FakeExtractor::new(2);

        let summary =
            run_with(&fixture, &mut workbook, &mut extractor, RunHooks::default()).unwrap();
        assert_eq!(summary.total_files, 4);
        assert_eq!(summary.processed_files, 4);
        assert_eq!(summary.parse_failures, 3);
        assert_eq!(summary.capture_failures, 1);
        assert_eq!(summary.videos_placed, 0);
        assert_eq!(extractor.calls.len(), 1);
    }

    #[test]
    fn captures_in_an_existing_folder_leave_other_files() {
        let fixture = Fixture::new();
        fixture.video(PipeKind::Vertical, "1102동 4호 입상관 세탁.mp4");
        let shared = fixture.work_dir().join("photos");
        fs::create_dir_all(&shared).unwrap();
        fs::write(shared.join("keep.jpg"), b"mine").unwrap();

        let mut workbook = template_workbook();
        {
            let mut captures = CaptureDir::new(&shared);
            let mut ingestor = Ingestor::new(
                &mut workbook,
                FakeExtractor::new(3),
                RunHooks::default(),
                &mut captures,
            );
            let summary = ingestor.run(fixture.work_dir()).unwrap();
            assert_eq!(summary.videos_placed, 1);
        }

        let left: Vec<_> = fs::read_dir(&shared)
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(left, vec![std::ffi::OsString::from("keep.jpg")]);
    }

    #[test]
    fn missing_template_aborts_before_processing() {
        let fixture = Fixture::new();
        fixture.video(PipeKind::Vertical, "1102동 4호 입상관 세탁.mp4");
        let mut workbook = Workbook::new();
        workbook
            .add_sheet(crate::report::tests::vertical_template())
            .unwrap();
        let mut extractor = FakeExtractor::new(3);

        let err =
            run_with(&fixture, &mut workbook, &mut extractor, RunHooks::default()).unwrap_err();
        assert!(matches!(err, IngestError::MissingTemplate(_)));
        assert!(extractor.calls.is_empty());
        assert_eq!(workbook.sheets().len(), 1);
    }

    #[test]
    fn progress_reports_every_file_against_total() {
        let fixture = Fixture::new();
        fixture.video(PipeKind::Vertical, "1102동 4호 입상관 세탁.mp4");
        fixture.video(PipeKind::Horizontal, "1101동 1-1호 횡주관 배수.mp4");
        fixture.photo(PipeKind::Horizontal, "1101동 1-1호 횡주관 배수_부식_지하.jpg");
        let mut workbook = template_workbook();
        let mut extractor = FakeExtractor::new(3);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let hooks = RunHooks::default()
            .with_total(10)
            .with_progress(move |p| sink.borrow_mut().push((p.processed, p.total)));

        run_with(&fixture, &mut workbook, &mut extractor, hooks).unwrap();
        assert_eq!(*seen.borrow(), vec![(1, 10), (2, 10), (3, 10)]);
    }

    #[test]
    fn missing_source_folders_are_not_fatal() {
        let root = tempfile::tempdir().unwrap();
        let mut workbook = template_workbook();
        let mut captures = CaptureDir::new(root.path().join("captured_images"));
        let mut ingestor =
            Ingestor::new(&mut workbook, FakeExtractor::new(3), RunHooks::default(), &mut captures);
        let summary = ingestor.run(root.path()).unwrap();
        assert_eq!(summary.total_files, 0);
        assert!(!summary.cancelled);
    }
}
