//! Workbook Model Module
//!
//! An in-memory view of a spreadsheet: named sheets of cells addressed by
//! 1-based (row, column), images anchored at cells, and row/column
//! dimensions. The view remembers which cells were written and which
//! template each new sheet was cloned from, so [`crate::xlsx::save`] can
//! replay just those edits onto the source file.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::error::{IngestError, Result};

/// A cell value as read from or written to a workbook.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Text(String),
    Number(f64),
}

impl CellValue {
    /// Text form used for header lookup and key comparison.
    pub fn as_text(&self) -> String {
        match self {
            CellValue::Text(s) => s.clone(),
            CellValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                format!("{}", *n as i64)
            }
            CellValue::Number(n) => n.to_string(),
        }
    }
}

/// A JPEG anchored with its top-left corner at a cell.
#[derive(Debug, Clone)]
pub struct EmbeddedImage {
    pub row: u32,
    pub col: u32,
    pub jpeg: Vec<u8>,
}

/// Handle to a sheet inside a [`Workbook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SheetId(usize);

#[derive(Debug, Clone)]
pub struct Sheet {
    name: String,
    origin: Option<String>,
    cells: BTreeMap<(u32, u32), CellValue>,
    edited: BTreeSet<(u32, u32)>,
    images: Vec<EmbeddedImage>,
    row_heights: BTreeMap<u32, f64>,
    column_widths: BTreeMap<u32, f64>,
}

impl Sheet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            origin: None,
            cells: BTreeMap::new(),
            edited: BTreeSet::new(),
            images: Vec::new(),
            row_heights: BTreeMap::new(),
            column_widths: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Template this sheet was cloned from, if it is new in this run.
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    pub fn cell(&self, row: u32, col: u32) -> Option<&CellValue> {
        self.cells.get(&(row, col))
    }

    /// Cell content as trimmed text; empty when the cell is unset.
    pub fn cell_text(&self, row: u32, col: u32) -> String {
        self.cell(row, col)
            .map(|v| v.as_text().trim().to_string())
            .unwrap_or_default()
    }

    pub fn set_value(&mut self, row: u32, col: u32, value: CellValue) {
        self.cells.insert((row, col), value);
        self.edited.insert((row, col));
    }

    /// Records a value read from the source file. Unlike
    /// [`Sheet::set_value`] it is not written back on save.
    pub(crate) fn restore_value(&mut self, row: u32, col: u32, value: CellValue) {
        self.cells.insert((row, col), value);
    }

    pub fn set_text(&mut self, row: u32, col: u32, text: impl Into<String>) {
        self.set_value(row, col, CellValue::Text(text.into()));
    }

    /// Last row holding a value, or 0 for an empty sheet.
    pub fn max_row(&self) -> u32 {
        self.cells.keys().map(|(r, _)| *r).max().unwrap_or(0)
    }

    pub fn max_column(&self) -> u32 {
        self.cells.keys().map(|(_, c)| *c).max().unwrap_or(0)
    }

    /// Finds the column whose header cell in `header_row` equals `header`
    /// after trimming.
    pub fn find_column(&self, header_row: u32, header: &str) -> Option<u32> {
        (1..=self.max_column()).find(|&col| self.cell_text(header_row, col) == header)
    }

    /// Anchors an image at a cell. An image already anchored there is
    /// replaced so re-running a file does not stack copies.
    pub fn insert_image(&mut self, row: u32, col: u32, jpeg: Vec<u8>) {
        self.images.retain(|img| !(img.row == row && img.col == col));
        self.images.push(EmbeddedImage { row, col, jpeg });
    }

    pub fn set_row_height(&mut self, row: u32, height: f64) {
        self.row_heights.insert(row, height);
    }

    pub fn set_column_width(&mut self, col: u32, width: f64) {
        self.column_widths.insert(col, width);
    }

    /// Cells written since the sheet was loaded or cloned.
    pub fn edited_cells(&self) -> impl Iterator<Item = (u32, u32, &CellValue)> {
        self.edited
            .iter()
            .filter_map(|&(r, c)| self.cells.get(&(r, c)).map(|v| (r, c, v)))
    }

    pub fn images(&self) -> &[EmbeddedImage] {
        &self.images
    }

    pub fn image_at(&self, row: u32, col: u32) -> Option<&EmbeddedImage> {
        self.images.iter().find(|img| img.row == row && img.col == col)
    }

    pub fn row_heights(&self) -> impl Iterator<Item = (u32, f64)> + '_ {
        self.row_heights.iter().map(|(&r, &h)| (r, h))
    }

    pub fn column_widths(&self) -> impl Iterator<Item = (u32, f64)> + '_ {
        self.column_widths.iter().map(|(&c, &w)| (c, w))
    }
}

/// An ordered collection of uniquely named sheets, optionally tied to the
/// file it was read from.
#[derive(Debug, Clone, Default)]
pub struct Workbook {
    source: Option<PathBuf>,
    sheets: Vec<Sheet>,
}

impl Workbook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(path: impl Into<PathBuf>) -> Self {
        Self {
            source: Some(path.into()),
            sheets: Vec::new(),
        }
    }

    /// File the workbook was loaded from; saving edits a copy of it.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Appends a sheet. Fails if the name is already taken.
    pub fn add_sheet(&mut self, sheet: Sheet) -> Result<SheetId> {
        if self.find_sheet(sheet.name()).is_some() {
            return Err(IngestError::Workbook(format!(
                "sheet '{}' already exists",
                sheet.name()
            )));
        }
        self.sheets.push(sheet);
        Ok(SheetId(self.sheets.len() - 1))
    }

    pub fn find_sheet(&self, name: &str) -> Option<SheetId> {
        self.sheets.iter().position(|s| s.name == name).map(SheetId)
    }

    pub fn has_sheet(&self, name: &str) -> bool {
        self.find_sheet(name).is_some()
    }

    pub fn sheet_names(&self) -> impl Iterator<Item = &str> {
        self.sheets.iter().map(|s| s.name.as_str())
    }

    pub fn sheets(&self) -> &[Sheet] {
        &self.sheets
    }

    pub fn sheet(&self, id: SheetId) -> &Sheet {
        &self.sheets[id.0]
    }

    pub fn sheet_mut(&mut self, id: SheetId) -> &mut Sheet {
        &mut self.sheets[id.0]
    }

    /// Copies the sheet named `source` (cells, images, dimensions) into a new
    /// sheet named `name`, appended at the end.
    pub fn clone_sheet(&mut self, source: &str, name: &str) -> Result<SheetId> {
        let id = self
            .find_sheet(source)
            .ok_or_else(|| IngestError::MissingTemplate(source.to_string()))?;
        let mut copy = self.sheet(id).clone();
        copy.name = name.to_string();
        copy.origin = Some(source.to_string());
        self.add_sheet(copy)
    }
}

/// Column letters of a 1-based column, e.g. `27` -> `AA`.
pub fn column_letters(col: u32) -> String {
    let mut n = col.max(1) - 1;
    let mut letters = String::new();
    loop {
        letters.insert(0, (b'A' + (n % 26) as u8) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    letters
}

/// A1-style address of a 1-based (row, column) pair, e.g. `(4, 2)` -> `B4`.
pub fn cell_address(row: u32, col: u32) -> String {
    format!("{}{}", column_letters(col), row)
}
