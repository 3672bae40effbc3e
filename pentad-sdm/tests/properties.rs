use std::collections::{BTreeMap, BTreeSet};

use proptest::prelude::*;

use pentad_sdm::species::ReferenceSpecies;
use pentad_sdm::{
    batched, Aggregator, CellCodec, CoordGeo, GridCellId, GridKind, PentadCodec, PipelineConfig,
    RawRecord, SpeciesId, SpeciesReference,
};

const PENTAD: f64 = 5.0 / 60.0;
const EPS: f64 = 1e-6;

const NAMES: [&str; 4] = ["Bubo africanus", "Passer melanurus", "Corvus albus", "Struthio camelus"];

fn reference() -> SpeciesReference {
    let species = |id: &str, name: &str| ReferenceSpecies {
        id: SpeciesId::from(id),
        common_name: String::new(),
        scientific_name: name.to_owned(),
        source_names: BTreeMap::from([("ebirds_name".to_owned(), name.to_owned())]),
    };
    SpeciesReference::new(
        ["ebirds_name".to_owned()],
        vec![species("7", NAMES[0]), species("12", NAMES[1]), species("3", NAMES[3])],
    )
    .unwrap()
}

fn record() -> impl Strategy<Value = RawRecord> {
    (0..NAMES.len(), -34.5..-33.5f64, 18.0..19.0f64)
        .prop_map(|(name, lat, lon)| RawRecord::new(NAMES[name], lat, lon))
}

proptest! {
    #[test]
    fn decoded_corner_bounds_the_point(lat in -89.9..89.9f64, lon in -179.9..179.9f64) {
        let id = PentadCodec::cell_of(lat, lon);
        let corner = PentadCodec::cell_to_coord(&id).unwrap();

        prop_assert_eq!(corner.latitude.is_sign_negative(), lat.is_sign_negative());
        prop_assert_eq!(corner.longitude.is_sign_negative(), lon.is_sign_negative());
        prop_assert!(lat.abs() >= corner.latitude.abs() - EPS);
        prop_assert!(lat.abs() < corner.latitude.abs() + PENTAD + EPS);
        prop_assert!(lon.abs() >= corner.longitude.abs() - EPS);
        prop_assert!(lon.abs() < corner.longitude.abs() + PENTAD + EPS);
    }

    #[test]
    fn corner_encodes_to_its_own_cell(lat in -89.9..89.9f64, lon in -179.9..179.9f64) {
        let id = PentadCodec::cell_of(lat, lon);
        let corner = GridKind::Formula.decode(&id).unwrap();
        prop_assert_eq!(GridKind::Formula.encode(&corner), Some(id));
    }

    #[test]
    fn batching_never_changes_the_matrix(
        records in prop::collection::vec(record(), 0..200),
        batch_size in 1usize..50,
    ) {
        let master: Vec<GridCellId> = records
            .iter()
            .filter_map(|r| PentadCodec.encode(&CoordGeo::new(r.latitude?, r.longitude?)))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let config = PipelineConfig::default();
        let reference = reference();
        let resolver = reference.resolver("ebirds_name").unwrap();
        let grid = GridKind::Formula;
        let aggregator = Aggregator::new(&config, &grid, &master, reference.columns());

        let whole = aggregator
            .aggregate(batched(records.clone(), records.len().max(1)), &resolver)
            .unwrap();
        let chunked = aggregator
            .aggregate(batched(records.clone(), batch_size), &resolver)
            .unwrap();

        prop_assert_eq!(&whole.matrix, &chunked.matrix);
        prop_assert_eq!(whole.matrix.total(), records.len() as u64);
    }
}
