use inundata::core::quality::{assign_flags, FlagContext, QualityFlag, QualityThresholds, SCHEMA};
use inundata::types::AllocationMethod;
use chrono::NaiveDate;

#[test]
fn published_schema_covers_all_fifteen_flags() {
    assert_eq!(SCHEMA.len(), 15);
    assert_eq!(QualityFlag::ALL.len(), 15);
    for (i, spec) in SCHEMA.iter().enumerate() {
        assert_eq!(usize::from(spec.id), i + 1);
        assert!(!spec.name.is_empty());
        assert!(!spec.trigger.is_empty());
    }
    // Names are unique
    let mut names: Vec<&str> = SCHEMA.iter().map(|s| s.name).collect();
    names.sort_unstable();
    names.dedup();
    assert_eq!(names.len(), 15);
}

#[test]
fn every_flag_is_reachable_from_some_context() {
    let thresholds = QualityThresholds::default();

    let base = FlagContext {
        start_day_estimated: true,
        end_day_estimated: true,
        start_date: NaiveDate::from_ymd_opt(1999, 6, 1),
        end_date: NaiveDate::from_ymd_opt(1999, 6, 10),
        has_admin_units: true,
        processed: true,
        allocation: Some(AllocationMethod::PopulationWeighted),
        flood_map_available: false,
        population_available: false,
        grid_mismatch: true,
        record_country: "Spain".to_string(),
        boundary_country: "Portugal".to_string(),
        adm1_code: 100,
        flooded_area_km2: Some(0.0),
        clear_fraction: Some(0.05),
        no_valid_pixels: false,
    };
    let processed_flags = assign_flags(&base, &thresholds);

    let mut no_imagery = base.clone();
    no_imagery.no_valid_pixels = true;
    let no_imagery_flags = assign_flags(&no_imagery, &thresholds);

    let mut direct = base.clone();
    direct.allocation = Some(AllocationMethod::DirectReported);
    let direct_flags = assign_flags(&direct, &thresholds);

    let unprocessed_no_dates = FlagContext {
        processed: false,
        has_admin_units: false,
        ..FlagContext::default()
    };
    let missing_flags = assign_flags(&unprocessed_no_dates, &thresholds);

    let unprocessed_other = FlagContext {
        processed: false,
        has_admin_units: true,
        start_date: NaiveDate::from_ymd_opt(2024, 7, 1),
        end_date: NaiveDate::from_ymd_opt(2024, 7, 9),
        ..FlagContext::default()
    };
    let other_flags = assign_flags(&unprocessed_other, &thresholds);

    let mut reachable = processed_flags;
    reachable.extend(no_imagery_flags);
    reachable.extend(direct_flags);
    reachable.extend(missing_flags);
    reachable.extend(other_flags);

    for flag in QualityFlag::ALL {
        assert!(
            reachable.contains(&flag),
            "flag {} ({}) not reachable",
            flag.id(),
            flag
        );
    }
}
