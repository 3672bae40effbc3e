//! The master species list and per-source name resolution.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SdmError};

/// Numeric-string species identifier from the reference list.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpeciesId(String);

impl SpeciesId {
    /// Id of the bucket collecting names that matched no reference species.
    pub const UNMAPPED: &'static str = "0";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_owned())
    }

    pub fn unmapped() -> Self {
        Self(Self::UNMAPPED.to_owned())
    }

    pub fn is_unmapped(&self) -> bool {
        self.0 == Self::UNMAPPED
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn numeric(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl fmt::Display for SpeciesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpeciesId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SpeciesId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

/// Numeric ids in numeric order, then anything non-numeric lexically.
impl Ord for SpeciesId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for SpeciesId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Matrix column order: species in [`SpeciesId`] order, the unmapped bucket
/// last. Duplicates are dropped.
pub fn ordered_columns<I>(ids: I) -> Vec<SpeciesId>
where
    I: IntoIterator<Item = SpeciesId>,
{
    let species: BTreeSet<SpeciesId> = ids.into_iter().filter(|id| !id.is_unmapped()).collect();
    let mut columns: Vec<SpeciesId> = species.into_iter().collect();
    columns.push(SpeciesId::unmapped());
    columns
}


// --------------------------------------------------------------------------
// Reference list

#[derive(Clone, Debug, PartialEq)]
pub struct ReferenceSpecies {
    pub id: SpeciesId,
    pub common_name: String,
    pub scientific_name: String,
    /// Spelling of this species in each source, keyed by name column
    /// (e.g. `ebirds_name`). Empty spellings are never matched.
    pub source_names: BTreeMap<String, String>,
}

#[derive(Clone, Debug)]
pub struct SpeciesReference {
    name_columns: BTreeSet<String>,
    species: Vec<ReferenceSpecies>,
}

impl SpeciesReference {
    pub fn new<C>(name_columns: C, species: Vec<ReferenceSpecies>) -> Result<Self>
    where
        C: IntoIterator<Item = String>,
    {
        let mut seen = HashSet::new();
        for entry in &species {
            if entry.id.is_unmapped() {
                return Err(SdmError::ShapeMismatch(format!(
                    "species id {} is reserved for unmapped names",
                    SpeciesId::UNMAPPED
                )));
            }
            if !seen.insert(entry.id.clone()) {
                return Err(SdmError::ShapeMismatch(format!(
                    "duplicate species id {} in reference list",
                    entry.id
                )));
            }
        }
        Ok(Self {
            name_columns: name_columns.into_iter().collect(),
            species,
        })
    }

    pub fn species(&self) -> &[ReferenceSpecies] {
        &self.species
    }

    pub fn len(&self) -> usize {
        self.species.len()
    }

    pub fn is_empty(&self) -> bool {
        self.species.is_empty()
    }

    pub fn name_columns(&self) -> impl Iterator<Item = &str> {
        self.name_columns.iter().map(String::as_str)
    }

    pub fn contains(&self, id: &SpeciesId) -> bool {
        self.species.iter().any(|s| &s.id == id)
    }

    pub fn get(&self, id: &SpeciesId) -> Option<&ReferenceSpecies> {
        self.species.iter().find(|s| &s.id == id)
    }

    /// Every reference id, sorted, without the unmapped bucket.
    pub fn species_ids(&self) -> Vec<SpeciesId> {
        let mut ids: Vec<SpeciesId> = self.species.iter().map(|s| s.id.clone()).collect();
        ids.sort();
        ids
    }

    /// Count-matrix columns for this reference: every id, then the unmapped
    /// bucket.
    pub fn columns(&self) -> Vec<SpeciesId> {
        ordered_columns(self.species.iter().map(|s| s.id.clone()))
    }

    /// Name resolver for one source, keyed on its name column.
    pub fn resolver(&self, column: &str) -> Result<NameMapping> {
        if !self.name_columns.contains(column) {
            return Err(SdmError::UnknownNameColumn(column.to_owned()));
        }
        let mut by_name: HashMap<String, SpeciesId> = HashMap::new();
        for entry in &self.species {
            let Some(name) = entry.source_names.get(column) else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            if let Some(existing) = by_name.get(name) {
                // A record must land in exactly one column.
                warn!(
                    column,
                    name,
                    kept = %existing,
                    ignored = %entry.id,
                    "name maps to more than one species"
                );
                continue;
            }
            by_name.insert(name.to_owned(), entry.id.clone());
        }
        Ok(NameMapping {
            by_name,
            unmapped: SpeciesId::unmapped(),
        })
    }

    /// Resolver for a source whose records all belong to one species.
    pub fn fixed(&self, id: SpeciesId) -> Result<FixedSpecies> {
        if !self.contains(&id) {
            return Err(SdmError::UnknownSpecies(id));
        }
        Ok(FixedSpecies(id))
    }

    /// Matches reference scientific names against the distinct names seen in
    /// a source, to seed that source's name column.
    pub fn name_match_report<'a, I>(&self, observed: I) -> NameMatchReport
    where
        I: IntoIterator<Item = &'a str>,
    {
        let observed: HashSet<&str> = observed.into_iter().map(str::trim).collect();
        let mut report = NameMatchReport {
            observed_names: observed.len(),
            ..NameMatchReport::default()
        };
        for entry in &self.species {
            if observed.contains(entry.scientific_name.trim()) {
                report
                    .matched
                    .push((entry.id.clone(), entry.scientific_name.trim().to_owned()));
            } else {
                report.unmatched.push(entry.clone());
            }
        }
        report
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct NameMatchReport {
    /// Distinct species names present in the source.
    pub observed_names: usize,
    pub matched: Vec<(SpeciesId, String)>,
    pub unmatched: Vec<ReferenceSpecies>,
}


// --------------------------------------------------------------------------
// Resolution

/// Maps the species field of a raw record to a matrix column.
pub trait SpeciesResolver: Send + Sync {
    /// `None` when the record cannot be attributed at all (missing field);
    /// names that are present but unknown resolve to the unmapped bucket.
    fn resolve(&self, name: Option<&str>) -> Option<&SpeciesId>;
}

/// Name column of the reference list for one source.
#[derive(Clone, Debug)]
pub struct NameMapping {
    by_name: HashMap<String, SpeciesId>,
    unmapped: SpeciesId,
}

impl NameMapping {
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl SpeciesResolver for NameMapping {
    fn resolve(&self, name: Option<&str>) -> Option<&SpeciesId> {
        let name = name?.trim();
        if name.is_empty() {
            return None;
        }
        Some(self.by_name.get(name).unwrap_or(&self.unmapped))
    }
}

/// Every record belongs to the same species; the species field is ignored.
#[derive(Clone, Debug)]
pub struct FixedSpecies(SpeciesId);

impl SpeciesResolver for FixedSpecies {
    fn resolve(&self, _name: Option<&str>) -> Option<&SpeciesId> {
        Some(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn species(id: &str, scientific: &str, ebird: &str) -> ReferenceSpecies {
        ReferenceSpecies {
            id: SpeciesId::from(id),
            common_name: format!("common {id}"),
            scientific_name: scientific.to_owned(),
            source_names: BTreeMap::from([("ebirds_name".to_owned(), ebird.to_owned())]),
        }
    }

    fn reference() -> SpeciesReference {
        SpeciesReference::new(
            ["ebirds_name".to_owned()],
            vec![
                species("10", "Sagittarius serpentarius", "Sagittarius serpentarius"),
                species("2", "Struthio camelus", ""),
                species("7", "Bubo africanus", "Bubo africanus"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn ids_sort_numerically() {
        let mut ids: Vec<SpeciesId> = ["10", "2", "0", "7"].into_iter().map(SpeciesId::from).collect();
        ids.sort();
        let ids: Vec<&str> = ids.iter().map(SpeciesId::as_str).collect();
        assert_eq!(ids, ["0", "2", "7", "10"]);
    }

    #[test]
    fn columns_end_with_unmapped() {
        let columns = reference().columns();
        let columns: Vec<&str> = columns.iter().map(SpeciesId::as_str).collect();
        assert_eq!(columns, ["2", "7", "10", "0"]);
    }

    #[test]
    fn unknown_names_go_to_unmapped() {
        let mapping = reference().resolver("ebirds_name").unwrap();
        assert_eq!(mapping.resolve(Some("Bubo africanus")).unwrap().as_str(), "7");
        assert!(mapping.resolve(Some("Passer domesticus")).unwrap().is_unmapped());
        assert!(mapping.resolve(Some("")).is_none());
        assert!(mapping.resolve(None).is_none());
        // the blank spelling for species 2 never matches
        assert_eq!(mapping.len(), 2);
    }

    #[test]
    fn unknown_name_column_is_an_error() {
        assert!(matches!(
            reference().resolver("inat_name"),
            Err(SdmError::UnknownNameColumn(_))
        ));
    }

    #[test]
    fn rejects_reserved_and_duplicate_ids() {
        let reserved = SpeciesReference::new(Vec::new(), vec![species("0", "x", "x")]);
        assert!(reserved.is_err());
        let duplicate =
            SpeciesReference::new(Vec::new(), vec![species("4", "x", "x"), species("4", "y", "y")]);
        assert!(duplicate.is_err());
    }

    #[test]
    fn name_match_report_splits_reference() {
        let report = reference().name_match_report(["Struthio camelus", "Passer domesticus", "Struthio camelus"]);
        assert_eq!(report.observed_names, 2);
        assert_eq!(report.matched, vec![(SpeciesId::from("2"), "Struthio camelus".to_owned())]);
        assert_eq!(report.unmatched.len(), 2);
    }

    #[test]
    fn fixed_species_must_exist() {
        let reference = reference();
        assert!(reference.fixed(SpeciesId::from("7")).is_ok());
        assert!(matches!(
            reference.fixed(SpeciesId::from("99")),
            Err(SdmError::UnknownSpecies(_))
        ));
    }
}
