//! Image Placement Module
//!
//! Writes captured stills, defect photos and the derived text into report
//! cells. Images are shrunk to a fixed footprint that fits the report's cell
//! grid, and the row and column around them are sized to keep them visible.

use image::imageops::FilterType;
use image::ImageOutputFormat;
use log::{debug, warn};
use std::io::Cursor;
use std::path::{Path, PathBuf};

use crate::error::{IngestError, Result};
use crate::parser::{ParsedRecord, PipeKind};
use crate::report::{headers, HEADER_ROW, HORIZONTAL_INSPECTION_PHOTO_COLS};
use crate::workbook::{cell_address, Sheet};

/// Embedded image size in pixels; the aspect ratio is not kept.
pub const IMAGE_SIZE: (u32, u32) = (102, 96);
const IMAGE_JPEG_QUALITY: u8 = 70;
/// Row height (points) and column width (characters) around an image.
pub const IMAGE_ROW_HEIGHT: f64 = 74.0;
pub const IMAGE_COLUMN_WIDTH: f64 = 13.0;

/// What a placement call wrote and what it had to skip.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PlacementOutcome {
    pub images: usize,
    pub texts: usize,
    pub failures: usize,
}

impl PlacementOutcome {
    fn record(&mut self, result: Result<()>) {
        match result {
            Ok(()) => self.images += 1,
            Err(e) => {
                warn!("{}", e);
                self.failures += 1;
            }
        }
    }
}

/// Loads an image, resizes it to [`IMAGE_SIZE`] and re-encodes it as JPEG.
pub fn prepare_image(path: &Path) -> Result<Vec<u8>> {
    let failure = |reason: String| IngestError::Placement {
        cell: path.display().to_string(),
        reason,
    };
    let img = image::open(path).map_err(|e| failure(format!("could not read image: {}", e)))?;
    let resized = img.resize_exact(IMAGE_SIZE.0, IMAGE_SIZE.1, FilterType::Lanczos3);

    let mut encoded = Vec::new();
    resized
        .write_to(
            &mut Cursor::new(&mut encoded),
            ImageOutputFormat::Jpeg(IMAGE_JPEG_QUALITY),
        )
        .map_err(|e| failure(format!("could not encode image: {}", e)))?;
    Ok(encoded)
}

/// Anchors the resized image at (row, col) and sizes the row and column.
pub fn insert_image(sheet: &mut Sheet, image: &Path, row: u32, col: u32) -> Result<()> {
    let address = cell_address(row, col);
    let jpeg = prepare_image(image).map_err(|e| match e {
        IngestError::Placement { reason, .. } => IngestError::Placement {
            cell: format!("{}!{}", sheet.name(), address),
            reason,
        },
        other => other,
    })?;

    sheet.insert_image(row, col, jpeg);
    sheet.set_row_height(row, IMAGE_ROW_HEIGHT);
    sheet.set_column_width(col, IMAGE_COLUMN_WIDTH);
    debug!("Inserted image at {}!{}", sheet.name(), address);
    Ok(())
}

/// Target columns of the location photo and the two inspection photos.
///
/// The vertical layout names all three in its header row; the horizontal
/// layout only names the location photo and fixes the other two by position.
pub fn video_frame_columns(sheet: &Sheet, pipe_kind: PipeKind) -> [Option<u32>; 3] {
    let location = sheet.find_column(HEADER_ROW, headers::LOCATION_PHOTO);
    match pipe_kind {
        PipeKind::Vertical => [
            location,
            sheet.find_column(HEADER_ROW, headers::INSPECTION_PHOTO_1),
            sheet.find_column(HEADER_ROW, headers::INSPECTION_PHOTO_2),
        ],
        PipeKind::Horizontal => [
            location,
            Some(HORIZONTAL_INSPECTION_PHOTO_COLS[0]),
            Some(HORIZONTAL_INSPECTION_PHOTO_COLS[1]),
        ],
    }
}

/// Places the start/middle/end stills of one video into `row`. A missing
/// column skips only its own still.
pub fn place_video_frames(
    sheet: &mut Sheet,
    pipe_kind: PipeKind,
    frames: &[PathBuf],
    row: u32,
) -> PlacementOutcome {
    let mut outcome = PlacementOutcome::default();
    let columns = video_frame_columns(sheet, pipe_kind);
    for (frame, column) in frames.iter().zip(columns) {
        match column {
            Some(col) => outcome.record(insert_image(sheet, frame, row, col)),
            None => debug!("No column for {:?} in {}, skipped", frame, sheet.name()),
        }
    }
    outcome
}

/// Location text, annotated with the number of photos sharing the key when
/// more than one was found.
pub fn location_text(location: &str, group_size: usize) -> String {
    if group_size > 1 {
        format!("{}({})", location, group_size)
    } else {
        location.to_string()
    }
}

/// Places a defect photo and its flag/location text into `row`. Each of the
/// three columns is optional.
pub fn place_defect_photo(
    sheet: &mut Sheet,
    source_image: &Path,
    record: &ParsedRecord,
    row: u32,
    group_size: usize,
) -> PlacementOutcome {
    let mut outcome = PlacementOutcome::default();
    let image_col = sheet.find_column(HEADER_ROW, headers::DEFECT_PHOTO);
    let flag_col = sheet.find_column(HEADER_ROW, headers::DEFECT_FLAG);
    let location_col = sheet.find_column(HEADER_ROW, headers::LOCATION);

    if let Some(col) = image_col {
        outcome.record(insert_image(sheet, source_image, row, col));
    }

    let Some(defect) = record.defect() else {
        return outcome;
    };
    if let Some(col) = flag_col {
        sheet.set_text(row, col, defect.kind.as_str());
        outcome.texts += 1;
    }
    if let Some(col) = location_col {
        sheet.set_text(row, col, location_text(&defect.location, group_size));
        outcome.texts += 1;
    }
    outcome
}
