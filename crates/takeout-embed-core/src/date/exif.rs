use chrono::{NaiveDate, NaiveDateTime};
use exif::{In, Reader, Tag};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Date tags embedded in a media file. EXIF datetimes have no timezone
/// info - they are local time as-is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmbeddedDates {
    /// DateTimeOriginal
    pub original: Option<NaiveDateTime>,
    /// CreateDate / DateTimeDigitized
    pub create: Option<NaiveDateTime>,
    /// ModifyDate / DateTime
    pub modify: Option<NaiveDateTime>,
}

impl EmbeddedDates {
    pub fn is_empty(&self) -> bool {
        self.original.is_none() && self.create.is_none() && self.modify.is_none()
    }
}

/// Read the date tags of an image in-process. Returns None when the file
/// has no readable EXIF container.
pub fn read_embedded_dates(path: &Path) -> Option<EmbeddedDates> {
    let file = File::open(path).ok()?;
    let exif = Reader::new()
        .read_from_container(&mut BufReader::new(file))
        .ok()?;

    let read = |tag: Tag| {
        exif.get_field(tag, In::PRIMARY)
            .and_then(|field| parse_exif_datetime(&field.display_value().to_string()))
    };

    let dates = EmbeddedDates {
        original: read(Tag::DateTimeOriginal),
        create: read(Tag::DateTimeDigitized),
        modify: read(Tag::DateTime),
    };
    Some(dates)
}

/// Parse the datetime strings exif tools emit (`2022:12:21 01:44:43`,
/// `2022-12-21 01:44:43`, date-only forms, optional zone suffix).
/// Zeroed placeholders such as `0000:00:00 00:00:00` yield None.
pub fn parse_exif_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim().trim_matches('"');
    // Drop sub-seconds and zone suffixes ("+01:00", "Z").
    let main: String = s.chars().take(19).collect();
    let cleaned = main
        .replace('-', ":")
        .replace('/', ":")
        .replace('\\', ":")
        .replace('.', ":")
        .replace('T', " ");

    if let Ok(dt) = NaiveDateTime::parse_from_str(&cleaned, "%Y:%m:%d %H:%M:%S") {
        return Some(dt);
    }

    let date_part = cleaned.split(' ').next()?;
    NaiveDate::parse_from_str(date_part, "%Y:%m:%d")
        .ok()?
        .and_hms_opt(0, 0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exif_datetime() {
        let expected = NaiveDate::from_ymd_opt(2022, 12, 21)
            .unwrap()
            .and_hms_opt(1, 44, 43)
            .unwrap();
        assert_eq!(parse_exif_datetime("2022:12:21 01:44:43"), Some(expected));
        assert_eq!(parse_exif_datetime("2022-12-21 01:44:43"), Some(expected));
        assert_eq!(parse_exif_datetime("2022:12:21 01:44:43+01:00"), Some(expected));
        assert_eq!(parse_exif_datetime("2022-12-21T01:44:43Z"), Some(expected));
        assert_eq!(
            parse_exif_datetime("2022:12:21"),
            NaiveDate::from_ymd_opt(2022, 12, 21).unwrap().and_hms_opt(0, 0, 0)
        );
        assert_eq!(parse_exif_datetime("0000:00:00 00:00:00"), None);
        assert_eq!(parse_exif_datetime(""), None);
    }

    #[test]
    fn test_non_image_has_no_exif() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.jpg");
        std::fs::write(&path, b"not really a jpeg").unwrap();
        assert!(read_embedded_dates(&path).is_none());
    }
}
