//! Report Layout Module
//!
//! Knows where things live in the inspection report: which sheet a record
//! belongs to, which header names identify which columns, and which columns
//! the horizontal layout fixes by position. Resolves records to sheets and
//! rows with create-or-reuse semantics.

use log::{debug, info};
use std::collections::HashMap;

use crate::error::{IngestError, Result};
use crate::parser::{ParsedRecord, PipeKind};
use crate::workbook::{Sheet, SheetId, Workbook};

/// Row holding the column headers in every report sheet (1-based).
pub const HEADER_ROW: u32 = 3;

/// Nominal pipe diameter written into newly created rows.
pub const DEFAULT_PIPE_DIAMETER: &str = "100A";

/// Header texts looked up in [`HEADER_ROW`].
pub mod headers {
    pub const BUILDING: &str = "동";
    pub const UNIT: &str = "라인";
    pub const USAGE: &str = "용도";
    pub const DIAMETER: &str = "배관경";
    pub const LOCATION_PHOTO: &str = "위치사진";
    pub const INSPECTION_PHOTO_1: &str = "점검사진1";
    pub const INSPECTION_PHOTO_2: &str = "점검사진2";
    pub const DEFECT_PHOTO: &str = "이상배관사진";
    pub const DEFECT_FLAG: &str = "이상유무";
    pub const LOCATION: &str = "위치";
}

// The horizontal layout has no headers for these columns.
const HORIZONTAL_LINE_DETAIL_COL: u32 = 3;
const HORIZONTAL_USAGE_COL: u32 = 4;
const HORIZONTAL_DIAMETER_COL: u32 = 5;

/// Fixed columns of the two inspection photos in the horizontal layout.
pub const HORIZONTAL_INSPECTION_PHOTO_COLS: [u32; 2] = [7, 8];

/// Name of the sheet collecting one complex's records of one pipe kind.
pub fn sheet_name(complex: u32, pipe_kind: PipeKind) -> String {
    format!("점검결과사진({})_{}단지", pipe_kind.label(), complex)
}

/// Looks a header up in a report sheet, turning absence into
/// [`IngestError::MissingColumn`].
pub fn require_column(sheet: &Sheet, header: &str) -> Result<u32> {
    sheet
        .find_column(HEADER_ROW, header)
        .ok_or_else(|| IngestError::MissingColumn {
            sheet: sheet.name().to_string(),
            column: header.to_string(),
        })
}

/// Per-run map from (complex, pipe kind) to the sheet serving it.
#[derive(Debug, Default)]
pub struct SheetCache {
    sheets: HashMap<(u32, PipeKind), SheetId>,
    created: usize,
}

impl SheetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.sheets.clear();
        self.created = 0;
    }

    /// Number of sheets cloned from templates since the last clear.
    pub fn created(&self) -> usize {
        self.created
    }

    /// Returns the sheet for `(complex, pipe_kind)`, cloning the kind's
    /// template when no sheet of that name exists yet.
    pub fn resolve(
        &mut self,
        workbook: &mut Workbook,
        complex: u32,
        pipe_kind: PipeKind,
    ) -> Result<SheetId> {
        if let Some(&id) = self.sheets.get(&(complex, pipe_kind)) {
            return Ok(id);
        }

        let name = sheet_name(complex, pipe_kind);
        let id = match workbook.find_sheet(&name) {
            Some(id) => {
                info!("Using existing sheet: {}", name);
                id
            }
            None => {
                let template = pipe_kind.template_sheet();
                if !workbook.has_sheet(&template) {
                    return Err(IngestError::MissingTemplate(template));
                }
                let id = workbook.clone_sheet(&template, &name)?;
                self.created += 1;
                info!("Created sheet {} from {}", name, template);
                id
            }
        };
        self.sheets.insert((complex, pipe_kind), id);
        Ok(id)
    }
}

struct KeyColumns {
    building: u32,
    unit: u32,
    usage: u32,
    diameter: u32,
    line_detail: Option<u32>,
}

impl KeyColumns {
    fn locate(sheet: &Sheet, pipe_kind: PipeKind) -> Result<Self> {
        let building = require_column(sheet, headers::BUILDING)?;
        let unit = require_column(sheet, headers::UNIT)?;
        match pipe_kind {
            PipeKind::Vertical => Ok(Self {
                building,
                unit,
                usage: require_column(sheet, headers::USAGE)?,
                diameter: require_column(sheet, headers::DIAMETER)?,
                line_detail: None,
            }),
            PipeKind::Horizontal => Ok(Self {
                building,
                unit,
                usage: HORIZONTAL_USAGE_COL,
                diameter: HORIZONTAL_DIAMETER_COL,
                line_detail: Some(HORIZONTAL_LINE_DETAIL_COL),
            }),
        }
    }
}

/// Finds the data row matching the record's key, or fills the first row
/// below the header whose building cell is blank and returns that.
///
/// Matching compares trimmed cell text field by field; the line detail only
/// takes part for horizontal records.
pub fn resolve_row(sheet: &mut Sheet, record: &ParsedRecord) -> Result<u32> {
    let cols = KeyColumns::locate(sheet, record.pipe_kind())?;
    let key = record.row_key();

    let first_data_row = HEADER_ROW + 1;
    let existing = (first_data_row..=sheet.max_row()).find(|&row| {
        sheet.cell_text(row, cols.building) == key.building
            && sheet.cell_text(row, cols.unit) == key.unit
            && sheet.cell_text(row, cols.usage) == key.usage
            && match (cols.line_detail, key.line_detail.as_deref()) {
                (Some(col), Some(detail)) => sheet.cell_text(row, col) == detail,
                _ => true,
            }
    });
    if let Some(row) = existing {
        debug!("Matched existing row {} in {} for {}", row, sheet.name(), key);
        return Ok(row);
    }

    let mut row = first_data_row;
    while !sheet.cell_text(row, cols.building).is_empty() {
        row += 1;
    }

    sheet.set_text(row, cols.building, key.building.as_str());
    sheet.set_text(row, cols.unit, key.unit.as_str());
    sheet.set_text(row, cols.usage, key.usage.as_str());
    sheet.set_text(row, cols.diameter, DEFAULT_PIPE_DIAMETER);
    if let (Some(col), Some(detail)) = (cols.line_detail, key.line_detail.as_deref()) {
        sheet.set_text(row, col, detail);
    }
    info!("Created row {} in {}: {}", row, sheet.name(), key);
    Ok(row)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::parser::{parse_image, parse_video};

    /// Vertical template: every column is named in the header row.
    pub(crate) fn vertical_template() -> Sheet {
        let mut sheet = Sheet::new("입상sample");
        sheet.set_text(1, 1, "점검결과");
        for (col, header) in [
            "동", "라인", "용도", "배관경", "위치사진", "점검사진1", "점검사진2", "이상배관사진",
            "이상유무", "위치",
        ]
        .iter()
        .enumerate()
        {
            sheet.set_text(HEADER_ROW, col as u32 + 1, *header);
        }
        sheet
    }

    /// Horizontal template: building/unit/location headers only, the rest
    /// fixed by position.
    pub(crate) fn horizontal_template() -> Sheet {
        let mut sheet = Sheet::new("횡주sample");
        sheet.set_text(HEADER_ROW, 1, "동");
        sheet.set_text(HEADER_ROW, 2, "라인");
        sheet.set_text(HEADER_ROW, 6, "위치사진");
        sheet.set_text(HEADER_ROW, 9, "이상배관사진");
        sheet.set_text(HEADER_ROW, 10, "이상유무");
        sheet.set_text(HEADER_ROW, 11, "위치");
        sheet
    }

    pub(crate) fn template_workbook() -> Workbook {
        let mut workbook = Workbook::new();
        workbook.add_sheet(vertical_template()).unwrap();
        workbook.add_sheet(horizontal_template()).unwrap();
        workbook
    }

    #[test]
    fn sheet_names_encode_kind_and_complex() {
        assert_eq!(sheet_name(11, PipeKind::Vertical), "점검결과사진(입상)_11단지");
        assert_eq!(sheet_name(9, PipeKind::Horizontal), "점검결과사진(횡주)_9단지");
    }

    #[test]
    fn resolve_clones_once_and_caches() {
        let mut workbook = template_workbook();
        let mut cache = SheetCache::new();

        let a = cache.resolve(&mut workbook, 11, PipeKind::Vertical).unwrap();
        let b = cache.resolve(&mut workbook, 11, PipeKind::Vertical).unwrap();
        let c = cache.resolve(&mut workbook, 11, PipeKind::Horizontal).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(cache.created(), 2);
        assert_eq!(workbook.sheets().len(), 4);
        assert_eq!(workbook.sheet(a).name(), "점검결과사진(입상)_11단지");
    }

    #[test]
    fn resolve_reuses_sheet_already_in_workbook() {
        let mut workbook = template_workbook();
        workbook
            .clone_sheet("입상sample", "점검결과사진(입상)_9단지")
            .unwrap();
        let mut cache = SheetCache::new();
        cache.resolve(&mut workbook, 9, PipeKind::Vertical).unwrap();
        assert_eq!(cache.created(), 0);
        assert_eq!(workbook.sheets().len(), 3);
    }

    #[test]
    fn missing_template_is_reported() {
        let mut workbook = Workbook::new();
        workbook.add_sheet(vertical_template()).unwrap();
        let mut cache = SheetCache::new();
        let err = cache
            .resolve(&mut workbook, 11, PipeKind::Horizontal)
            .unwrap_err();
        assert!(matches!(err, IngestError::MissingTemplate(name) if name == "횡주sample"));
    }

    #[test]
    fn vertical_row_is_created_then_reused() {
        let mut sheet = vertical_template();
        let record = parse_video("1102동 4호 입상관 세탁.mp4", PipeKind::Vertical).unwrap();

        let first = resolve_row(&mut sheet, &record).unwrap();
        let second = resolve_row(&mut sheet, &record).unwrap();
        assert_eq!(first, HEADER_ROW + 1);
        assert_eq!(first, second);
        assert_eq!(sheet.max_row(), HEADER_ROW + 1);
        assert_eq!(sheet.cell_text(first, 1), "1102동");
        assert_eq!(sheet.cell_text(first, 2), "4호");
        assert_eq!(sheet.cell_text(first, 3), "세탁");
        assert_eq!(sheet.cell_text(first, 4), DEFAULT_PIPE_DIAMETER);
    }

    #[test]
    fn image_and_video_of_same_key_share_a_row() {
        let mut sheet = vertical_template();
        let video = parse_video("1102동 4호 입상관 세탁.mp4", PipeKind::Vertical).unwrap();
        let photo =
            parse_image("1102동 4호 입상관 세탁_이물질_옥상.jpg", PipeKind::Vertical).unwrap();
        let other = parse_video("1102동 5호 입상관 세탁.mp4", PipeKind::Vertical).unwrap();

        let row = resolve_row(&mut sheet, &video).unwrap();
        assert_eq!(resolve_row(&mut sheet, &photo).unwrap(), row);
        assert_eq!(resolve_row(&mut sheet, &other).unwrap(), row + 1);
    }

    #[test]
    fn existing_rows_match_with_whitespace() {
        let mut sheet = vertical_template();
        sheet.set_text(HEADER_ROW + 1, 1, "1101동");
        sheet.set_text(HEADER_ROW + 2, 1, " 1102동 ");
        sheet.set_text(HEADER_ROW + 2, 2, "4호 ");
        sheet.set_text(HEADER_ROW + 2, 3, "세탁");
        let record = parse_video("1102동 4호 입상관 세탁.mp4", PipeKind::Vertical).unwrap();
        assert_eq!(resolve_row(&mut sheet, &record).unwrap(), HEADER_ROW + 2);
    }

    #[test]
    fn new_rows_fill_first_blank_building_cell() {
        let mut sheet = vertical_template();
        sheet.set_text(HEADER_ROW + 1, 1, "1101동");
        sheet.set_text(HEADER_ROW + 3, 1, "1103동");
        let record = parse_video("1102동 4호 입상관 세탁.mp4", PipeKind::Vertical).unwrap();
        assert_eq!(resolve_row(&mut sheet, &record).unwrap(), HEADER_ROW + 2);
    }

    #[test]
    fn horizontal_rows_key_on_line_detail() {
        let mut sheet = horizontal_template();
        let a = parse_video("1101동 1-1호 횡주관 배수.mp4", PipeKind::Horizontal).unwrap();
        let b = parse_video("1101동 1-2호 횡주관 배수.mp4", PipeKind::Horizontal).unwrap();

        let row_a = resolve_row(&mut sheet, &a).unwrap();
        let row_b = resolve_row(&mut sheet, &b).unwrap();
        assert_ne!(row_a, row_b);
        assert_eq!(resolve_row(&mut sheet, &a).unwrap(), row_a);

        assert_eq!(sheet.cell_text(row_b, 2), "1호");
        assert_eq!(sheet.cell_text(row_b, 3), "1-2");
        assert_eq!(sheet.cell_text(row_b, 4), "배수");
        assert_eq!(sheet.cell_text(row_b, 5), DEFAULT_PIPE_DIAMETER);
    }

    #[test]
    fn missing_key_column_skips_record() {
        let mut sheet = Sheet::new("broken");
        sheet.set_text(HEADER_ROW, 1, "동");
        let record = parse_video("1102동 4호 입상관 세탁.mp4", PipeKind::Vertical).unwrap();
        let err = resolve_row(&mut sheet, &record).unwrap_err();
        assert!(matches!(err, IngestError::MissingColumn { column, .. } if column == "라인"));
    }
}
