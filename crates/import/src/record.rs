use std::io::Read;

use csv::StringRecord;
use haven_core::{RegionPath, RegionPathError};
use haven_storage::ServiceDraft;
use thiserror::Error;

/// One validated CSV row.
#[derive(Debug, Clone, PartialEq)]
pub enum ImportRecord {
    Regions { path: RegionPath },
    Service { path: RegionPath, service: ServiceDraft },
}

impl ImportRecord {
    pub fn path(&self) -> &RegionPath {
        match self {
            ImportRecord::Regions { path } | ImportRecord::Service { path, .. } => path,
        }
    }

    pub fn service(&self) -> Option<&ServiceDraft> {
        match self {
            ImportRecord::Regions { .. } => None,
            ImportRecord::Service { service, .. } => Some(service),
        }
    }
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("csv header has no `{0}` column")]
    MissingColumn(&'static str),
    #[error("region path: {0}")]
    Path(#[from] RegionPathError),
    #[error("service row is missing `{0}`")]
    IncompleteService(&'static str),
    #[error("unreadable csv record: {0}")]
    Csv(String),
}

/// Column positions resolved from the header row. Header names are matched
/// case-insensitively; `organisation` and `url` are accepted for the service
/// name and website.
#[derive(Debug, Clone, Default)]
pub struct Columns {
    levels: [Option<usize>; 4],
    service_name: Option<usize>,
    description: Option<usize>,
    address: Option<usize>,
    service_type: Option<usize>,
    phone: Option<usize>,
    website: Option<usize>,
}

impl Columns {
    pub fn from_headers(headers: &StringRecord) -> Result<Self, RecordError> {
        let position = |names: &[&str]| {
            headers.iter().position(|header| {
                let header = header.trim();
                names.iter().any(|name| header.eq_ignore_ascii_case(name))
            })
        };

        let columns = Self {
            levels: [
                position(&["country"]),
                position(&["province", "state"]),
                position(&["county", "district"]),
                position(&["city", "town"]),
            ],
            service_name: position(&["service_name", "name", "organisation", "organization"]),
            description: position(&["description"]),
            address: position(&["address"]),
            service_type: position(&["service_type", "type"]),
            phone: position(&["phone"]),
            website: position(&["website", "url"]),
        };

        if columns.levels[0].is_none() {
            return Err(RecordError::MissingColumn("country"));
        }
        Ok(columns)
    }

    /// `default_service_type` applies when the row has no type of its own.
    pub fn parse(
        &self,
        row: &StringRecord,
        default_service_type: Option<&str>,
    ) -> Result<ImportRecord, RecordError> {
        let field = |idx: Option<usize>| {
            idx.and_then(|idx| row.get(idx))
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string)
        };

        let levels = self.levels.map(field);
        let path = RegionPath::from_levels(&levels)?;

        let name = field(self.service_name);
        let description = field(self.description);
        let address = field(self.address);
        if name.is_none() && description.is_none() && address.is_none() {
            return Ok(ImportRecord::Regions { path });
        }

        let name = name.ok_or(RecordError::IncompleteService("service_name"))?;
        let address = address.ok_or(RecordError::IncompleteService("address"))?;
        let service_type =
            field(self.service_type).or_else(|| default_service_type.map(ToString::to_string));

        Ok(ImportRecord::Service {
            path,
            service: ServiceDraft {
                name,
                description: description.unwrap_or_default(),
                address,
                coordinates: None,
                service_type,
                phone: field(self.phone),
                website: field(self.website),
            },
        })
    }
}

/// A parsed row tagged with its 1-based position below the header.
pub type NumberedRecord = (usize, Result<ImportRecord, RecordError>);

/// Reads every record up front. A header that cannot be read fails the whole
/// source; a bad record only fails its own row.
pub fn read_records<R: Read>(
    source: R,
    default_service_type: Option<&str>,
) -> Result<Vec<NumberedRecord>, RecordError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(source);

    let headers = reader
        .headers()
        .map_err(|err| RecordError::Csv(err.to_string()))?
        .clone();
    let columns = Columns::from_headers(&headers)?;

    Ok(reader
        .records()
        .enumerate()
        .map(|(idx, result)| {
            let parsed = result
                .map_err(|err| RecordError::Csv(err.to_string()))
                .and_then(|row| columns.parse(&row, default_service_type));
            (idx + 1, parsed)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "\
Country,Province,County,City,Service_Name,Description,Address,Phone
CA,BC,CRD,Victoria,ABC Dental,Family dentistry,101 Fort St Victoria,250-555-0101
CA,YT,Whitehorse,,,,,
CA,,Fraser Valley,Mission,Gap Clinic,,1 Main St,
CA,BC,Metro Vancouver,Langley,Nameless,,,
,,,,,,,
";

    #[test]
    fn parses_rows_into_tagged_records() {
        let rows = read_records(CSV.as_bytes(), Some("Dentist")).unwrap();
        assert_eq!(rows.len(), 5);

        let (line, first) = &rows[0];
        assert_eq!(*line, 1);
        let first = first.as_ref().unwrap();
        assert_eq!(first.path().names(), ["CA", "BC", "CRD", "Victoria"]);
        let service = first.service().unwrap();
        assert_eq!(service.name, "ABC Dental");
        assert_eq!(service.service_type.as_deref(), Some("Dentist"));
        assert_eq!(service.phone.as_deref(), Some("250-555-0101"));
        assert_eq!(service.website, None);

        let second = rows[1].1.as_ref().unwrap();
        assert!(matches!(second, ImportRecord::Regions { path } if path.len() == 3));
    }

    #[test]
    fn malformed_rows_fail_individually() {
        let rows = read_records(CSV.as_bytes(), None).unwrap();
        assert!(matches!(rows[2].1, Err(RecordError::Path(RegionPathError::Gap { .. }))));
        assert!(matches!(rows[3].1, Err(RecordError::IncompleteService("address"))));
        assert!(matches!(rows[4].1, Err(RecordError::Path(RegionPathError::Empty))));
    }

    #[test]
    fn accepts_directory_export_headers() {
        let csv = "url,organisation,address,phone,country,province,city\n\
                   https://example.org/a,Access Learning,5 Elm St,,CA,NL,\n";
        let rows = read_records(csv.as_bytes(), Some("Education")).unwrap();
        let record = rows[0].1.as_ref().unwrap();
        let service = record.service().unwrap();
        assert_eq!(service.name, "Access Learning");
        assert_eq!(service.website.as_deref(), Some("https://example.org/a"));
        assert_eq!(record.path().names(), ["CA", "NL"]);
    }

    #[test]
    fn header_without_country_is_rejected() {
        let err = read_records("name,address\nx,y\n".as_bytes(), None).unwrap_err();
        assert!(matches!(err, RecordError::MissingColumn("country")));
    }
}
