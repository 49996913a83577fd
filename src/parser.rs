//! Identifier Parser Module
//!
//! Turns inspection filenames into structured records. Two grammars exist,
//! one per pipe kind, and each has a video and an image (defect photo) form:
//!
//! ```text
//! 1102동 4호 입상관 세탁.mp4              vertical video
//! 1101동 1-1호 횡주관 배수.mp4            horizontal video
//! 1102동 4호 입상관 세탁_이물질_옥상.jpg  vertical defect photo
//! ```
//!
//! Parsing is pure: nothing here touches the filesystem.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

use crate::error::{IngestError, Result};

/// Marker some video filenames carry to flag an abnormal pipe. It holds no
/// field value and is dropped before matching.
const ABNORMAL_MARKER: &str = "(이상배관)";

static VERTICAL_VIDEO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)동\s+(\d+)호\s+입상관\s+(.+)\.(?i:mp4)$").expect("vertical video regex")
});
static HORIZONTAL_VIDEO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)동\s+(\S+호)\s+횡주관\s+(.+)\.(?i:mp4)$").expect("horizontal video regex")
});
static VERTICAL_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)동\s+(\d+)호\s+입상관\s+(.+?)_(.+?)_(.+?)\.(?i:jpg|jpeg|png)$")
        .expect("vertical image regex")
});
static HORIZONTAL_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)동\s+(\S+호)\s+횡주관\s+(.+?)_(.+?)_(.+?)\.(?i:jpg|jpeg|png)$")
        .expect("horizontal image regex")
});
static UNIT_RANGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)-(\d+)호$").expect("unit range regex"));

const VIDEO_EXTENSIONS: &[&str] = &["mp4"];
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Pipe segment category. Each kind has its own filename grammar, source
/// folder and report layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeKind {
    Vertical,
    Horizontal,
}

impl PipeKind {
    /// Processing order of the source folders.
    pub const ALL: [PipeKind; 2] = [PipeKind::Vertical, PipeKind::Horizontal];

    /// Short Korean label used in sheet names.
    pub fn label(self) -> &'static str {
        match self {
            PipeKind::Vertical => "입상",
            PipeKind::Horizontal => "횡주",
        }
    }

    /// Name of the source folder, which is also the marker token in filenames.
    pub fn folder_name(self) -> &'static str {
        match self {
            PipeKind::Vertical => "입상관",
            PipeKind::Horizontal => "횡주관",
        }
    }

    /// Name of the template sheet cloned for this kind.
    pub fn template_sheet(self) -> String {
        format!("{}sample", self.label())
    }
}

impl fmt::Display for PipeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How a directory entry is handled, decided by its extension alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Image,
}

/// Classifies a filename by extension (case-insensitive). Returns `None` for
/// files the pipeline ignores.
pub fn classify(filename: &str) -> Option<MediaKind> {
    let (_, ext) = filename.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Video)
    } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Image)
    } else {
        None
    }
}

/// Defect details carried by photo filenames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defect {
    pub kind: String,
    pub location: String,
}

/// Fields extracted from one filename. Horizontal records always have a
/// line detail and vertical records never do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRecord {
    pipe_kind: PipeKind,
    building_id: String,
    unit_id: String,
    line_detail: Option<String>,
    usage: String,
    defect: Option<Defect>,
}

/// Identifies one logical inspection entry within a worksheet. Values are in
/// the form written to the report (`1102동`, `4호`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowKey {
    pub building: String,
    pub unit: String,
    pub usage: String,
    pub line_detail: Option<String>,
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.line_detail {
            Some(detail) => write!(f, "{} {} ({}) {}", self.building, self.unit, detail, self.usage),
            None => write!(f, "{} {} {}", self.building, self.unit, self.usage),
        }
    }
}

impl ParsedRecord {
    fn vertical(building_id: &str, unit_id: &str, usage: &str, defect: Option<Defect>) -> Self {
        Self {
            pipe_kind: PipeKind::Vertical,
            building_id: building_id.to_string(),
            unit_id: unit_id.to_string(),
            line_detail: None,
            usage: usage.trim().to_string(),
            defect,
        }
    }

    fn horizontal(
        building_id: &str,
        unit_id: &str,
        line_detail: String,
        usage: &str,
        defect: Option<Defect>,
    ) -> Self {
        Self {
            pipe_kind: PipeKind::Horizontal,
            building_id: building_id.to_string(),
            unit_id: unit_id.to_string(),
            line_detail: Some(line_detail),
            usage: usage.trim().to_string(),
            defect,
        }
    }

    pub fn pipe_kind(&self) -> PipeKind {
        self.pipe_kind
    }

    /// Numeric building number, e.g. `"1102"`.
    pub fn building_id(&self) -> &str {
        &self.building_id
    }

    /// Numeric unit number, e.g. `"4"`.
    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    pub fn line_detail(&self) -> Option<&str> {
        self.line_detail.as_deref()
    }

    pub fn usage(&self) -> &str {
        &self.usage
    }

    pub fn defect(&self) -> Option<&Defect> {
        self.defect.as_ref()
    }

    /// Building text as written to the report, e.g. `"1102동"`.
    pub fn building_label(&self) -> String {
        format!("{}동", self.building_id)
    }

    /// Unit text as written to the report, e.g. `"4호"`.
    pub fn unit_label(&self) -> String {
        format!("{}호", self.unit_id)
    }

    pub fn row_key(&self) -> RowKey {
        RowKey {
            building: self.building_label(),
            unit: self.unit_label(),
            usage: self.usage.clone(),
            line_detail: self.line_detail.clone(),
        }
    }

    /// Report partition this record belongs to.
    pub fn complex(&self) -> Result<u32> {
        resolve_complex(&self.building_id)
    }
}

/// Maps a building identifier to its complex: the building number divided
/// by 100 (`1102` -> 11, `901` -> 9). A trailing `동` is accepted.
pub fn resolve_complex(building_id: &str) -> Result<u32> {
    let digits = building_id.trim();
    let digits = digits.strip_suffix('동').unwrap_or(digits);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(IngestError::InvalidIdentifier(building_id.to_string()));
    }
    let number: u32 = digits
        .parse()
        .map_err(|_| IngestError::InvalidIdentifier(building_id.to_string()))?;
    Ok(number / 100)
}

/// Parses a video filename under the grammar of `pipe_kind`.
pub fn parse_video(filename: &str, pipe_kind: PipeKind) -> Result<ParsedRecord> {
    let clean = filename.replace(ABNORMAL_MARKER, "");
    let clean = clean.trim();
    match pipe_kind {
        PipeKind::Vertical => {
            let caps = VERTICAL_VIDEO
                .captures(clean)
                .ok_or_else(|| mismatch(filename, pipe_kind))?;
            Ok(ParsedRecord::vertical(&caps[1], &caps[2], &caps[3], None))
        }
        PipeKind::Horizontal => {
            let caps = HORIZONTAL_VIDEO
                .captures(clean)
                .ok_or_else(|| mismatch(filename, pipe_kind))?;
            let (unit, detail) = split_unit_range(filename, &caps[2])?;
            Ok(ParsedRecord::horizontal(&caps[1], &unit, detail, &caps[3], None))
        }
    }
}

/// Parses a defect photo filename under the grammar of `pipe_kind`.
pub fn parse_image(filename: &str, pipe_kind: PipeKind) -> Result<ParsedRecord> {
    let name = filename.trim();
    let regex = match pipe_kind {
        PipeKind::Vertical => &*VERTICAL_IMAGE,
        PipeKind::Horizontal => &*HORIZONTAL_IMAGE,
    };
    let caps = regex
        .captures(name)
        .ok_or_else(|| mismatch(filename, pipe_kind))?;
    let defect = Some(Defect {
        kind: caps[4].trim().to_string(),
        location: caps[5].trim().to_string(),
    });
    match pipe_kind {
        PipeKind::Vertical => Ok(ParsedRecord::vertical(&caps[1], &caps[2], &caps[3], defect)),
        PipeKind::Horizontal => {
            let (unit, detail) = split_unit_range(filename, &caps[2])?;
            Ok(ParsedRecord::horizontal(&caps[1], &unit, detail, &caps[3], defect))
        }
    }
}

/// Splits `1-1호` into the unit (`1`) and the line detail (`1-1`).
fn split_unit_range(filename: &str, range: &str) -> Result<(String, String)> {
    let caps = UNIT_RANGE.captures(range).ok_or_else(|| IngestError::Parse {
        file: filename.to_string(),
        reason: format!("unit range '{}' is not of the form <unit>-<detail>호", range),
    })?;
    Ok((caps[1].to_string(), format!("{}-{}", &caps[1], &caps[2])))
}

fn mismatch(filename: &str, pipe_kind: PipeKind) -> IngestError {
    IngestError::Parse {
        file: filename.to_string(),
        reason: format!("expected the {} grammar", pipe_kind.folder_name()),
    }
}
