//! Workbook Persistence Module
//!
//! Reads `.xlsx` cell values into the in-memory [`Workbook`] with calamine.
//! Saving reopens the source file with umya-spreadsheet and applies only
//! what the run changed: new sheets are cloned from their template sheet,
//! then written cells, row heights, column widths and images are replayed.
//! Everything else in the file (styles, merged ranges, formulas, drawings
//! from earlier runs) is left as it was.

use calamine::{open_workbook_auto, Data, Reader};
use log::{debug, info};
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use umya_spreadsheet::structs::drawing::spreadsheet::MarkerType;
use umya_spreadsheet::structs::Image as SheetImage;
use umya_spreadsheet::{Spreadsheet, Worksheet};

use crate::error::{IngestError, Result};
use crate::workbook::{cell_address, column_letters, CellValue, Sheet, Workbook};

/// Loads every sheet of the workbook at `path`.
pub fn load(path: &Path) -> Result<Workbook> {
    let mut source = open_workbook_auto(path)
        .map_err(|e| workbook_error(format!("could not open {:?}", path), e))?;

    let names: Vec<String> = source.sheet_names().to_vec();
    let mut workbook = Workbook::with_source(path);
    for name in names {
        let range = source
            .worksheet_range(&name)
            .map_err(|e| workbook_error(format!("could not read sheet '{}'", name), e))?;
        let (start_row, start_col) = range.start().unwrap_or((0, 0));

        let mut sheet = Sheet::new(name.as_str());
        for (r, c, data) in range.used_cells() {
            let Some(value) = to_cell_value(data) else {
                continue;
            };
            // calamine positions are 0-based and relative to the range start.
            let row = start_row + r as u32 + 1;
            let col = start_col + c as u32 + 1;
            sheet.restore_value(row, col, value);
        }
        debug!("Loaded sheet '{}' ({} rows)", name, sheet.max_row());
        workbook.add_sheet(sheet)?;
    }

    info!(
        "Loaded workbook {:?} with {} sheets",
        path,
        workbook.sheets().len()
    );
    Ok(workbook)
}

/// Writes the workbook to `path`, creating parent directories as needed.
/// The source file itself is never modified.
pub fn save(workbook: &Workbook, path: &Path) -> Result<()> {
    let mut book = match workbook.source() {
        Some(source) => umya_spreadsheet::reader::xlsx::read(source)
            .map_err(|e| workbook_error(format!("could not reopen {:?}", source), e))?,
        None => umya_spreadsheet::new_file_empty_worksheet(),
    };

    // All sheets exist before any edit, so clones start from pristine templates.
    for sheet in workbook.sheets() {
        ensure_sheet(&mut book, sheet)?;
    }

    let staging = tempfile::tempdir()?;
    for sheet in workbook.sheets() {
        let target = book.get_sheet_by_name_mut(sheet.name()).ok_or_else(|| {
            IngestError::Workbook(format!("sheet '{}' vanished while saving", sheet.name()))
        })?;
        apply_edits(target, sheet, staging.path())?;
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    umya_spreadsheet::writer::xlsx::write(&book, path)
        .map_err(|e| workbook_error(format!("could not save {:?}", path), e))?;
    info!("Saved workbook to {:?}", path);
    Ok(())
}

/// Adds `sheet` to the file when it is new, as a copy of its template if
/// the file has one.
fn ensure_sheet(book: &mut Spreadsheet, sheet: &Sheet) -> Result<()> {
    if book.get_sheet_by_name(sheet.name()).is_some() {
        return Ok(());
    }
    let template = sheet
        .origin()
        .and_then(|origin| book.get_sheet_by_name(origin))
        .cloned();
    let added = match template {
        Some(mut copy) => {
            copy.set_name(sheet.name());
            book.add_sheet(copy)
        }
        None => book.new_sheet(sheet.name()),
    };
    added
        .map(|_| ())
        .map_err(|e| workbook_error(format!("could not add sheet '{}'", sheet.name()), e))?;
    debug!("Added sheet '{}' (from {:?})", sheet.name(), sheet.origin());
    Ok(())
}

fn apply_edits(target: &mut Worksheet, sheet: &Sheet, staging: &Path) -> Result<()> {
    for (row, col, value) in sheet.edited_cells() {
        let cell = target.get_cell_mut(cell_address(row, col).as_str());
        match value {
            CellValue::Text(s) => {
                cell.set_value(s.as_str());
            }
            CellValue::Number(n) => {
                cell.set_value_number(*n);
            }
        }
    }

    for (row, height) in sheet.row_heights() {
        let dimension = target.get_row_dimension_mut(&row);
        dimension.set_height(height);
        dimension.set_custom_height(true);
    }
    for (col, width) in sheet.column_widths() {
        target
            .get_column_dimension_mut(&column_letters(col))
            .set_width(width);
    }

    // umya embeds images from files; names are content hashes so reruns
    // never collide with media already in the file.
    for image in sheet.images() {
        let staged = staging.join(format!("{:x}.jpeg", md5::compute(&image.jpeg)));
        fs::write(&staged, &image.jpeg)?;
        let staged = staged
            .to_str()
            .ok_or_else(|| IngestError::Workbook(format!("non UTF-8 staging path {:?}", staged)))?;

        let mut marker = MarkerType::default();
        marker.set_coordinate(cell_address(image.row, image.col));
        let mut embedded = SheetImage::default();
        embedded.new_image(staged, marker);
        target.add_image(embedded);
    }
    Ok(())
}

/// Default output location: `<stem>_processed.xlsx` beside the input.
pub fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workbook".to_string());
    input.with_file_name(format!("{}_processed.xlsx", stem))
}

fn to_cell_value(data: &Data) -> Option<CellValue> {
    match data {
        Data::Empty => None,
        Data::String(s) => Some(CellValue::Text(s.clone())),
        Data::Float(f) => Some(CellValue::Number(*f)),
        Data::Int(i) => Some(CellValue::Number(*i as f64)),
        other => Some(CellValue::Text(other.to_string())),
    }
}

fn workbook_error(context: impl Display, err: impl Display) -> IngestError {
    IngestError::Workbook(format!("{}: {}", context, err))
}
