use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::types::{mission_start, AllocationMethod};

/// Data-quality flags attached to one event's metrics record. Ids are fixed
/// and published (see [`SCHEMA`]); multiple flags co-occur, so results carry
/// a set rather than a scalar.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum QualityFlag {
    /// 1 — start day missing upstream and defaulted
    StartDayEstimated,
    /// 2 — end day missing upstream and defaulted
    EndDayEstimated,
    /// 3 — event starts before the first available imagery
    PredatesImagery,
    /// 4 — classification artifact missing or unreadable for other reasons
    FloodMapUnavailable,
    /// 5 — no population raster covers the admin unit
    PopulationUnavailable,
    /// 6 — flood and population grids are misaligned
    GridMismatch,
    /// 7 — record-level impacts split across admin units by population weight
    ImpactsSplitByPopulation,
    /// 8 — original record named a single admin unit; value used directly
    ImpactsDirectlyReported,
    /// 9 — record lacked usable start/end dates and was not processed
    MissingEventDates,
    /// 10 — record lacked admin-unit references and was not processed
    MissingAdminUnits,
    /// 11 — record excluded from processing for other reasons
    UnprocessedOther,
    /// 12 — computation succeeded and flooded area is zero
    ZeroFloodedArea,
    /// 13 — matched polygon's country differs from the record's country
    CountryMismatch,
    /// 14 — cloud-clear fraction below the configured minimum
    LowClearFraction,
    /// 15 — zero valid pixels: no usable imagery in the window
    NoValidPixels,
}

/// One row of the published flag schema
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FlagSpec {
    pub id: u8,
    pub name: &'static str,
    pub trigger: &'static str,
}

/// The full published schema, in id order, so flag assignment is
/// independently auditable
pub const SCHEMA: [FlagSpec; 15] = [
    FlagSpec {
        id: 1,
        name: "start-day-estimated",
        trigger: "start day was missing upstream and defaulted",
    },
    FlagSpec {
        id: 2,
        name: "end-day-estimated",
        trigger: "end day was missing upstream and defaulted",
    },
    FlagSpec {
        id: 3,
        name: "predates-imagery",
        trigger: "event start predates the first available imagery",
    },
    FlagSpec {
        id: 4,
        name: "flood-map-unavailable",
        trigger: "classification artifact missing or unreadable, other causes",
    },
    FlagSpec {
        id: 5,
        name: "population-unavailable",
        trigger: "no population raster covers the admin unit",
    },
    FlagSpec {
        id: 6,
        name: "grid-mismatch",
        trigger: "flood and population grids are misaligned",
    },
    FlagSpec {
        id: 7,
        name: "impacts-split-by-population",
        trigger: "record impacts allocated across admin units by population weight",
    },
    FlagSpec {
        id: 8,
        name: "impacts-directly-reported",
        trigger: "single admin unit; reported impact value used directly",
    },
    FlagSpec {
        id: 9,
        name: "missing-event-dates",
        trigger: "record lacked usable start/end dates and was not processed",
    },
    FlagSpec {
        id: 10,
        name: "missing-admin-units",
        trigger: "record lacked admin-unit references and was not processed",
    },
    FlagSpec {
        id: 11,
        name: "unprocessed-other",
        trigger: "record excluded from processing for other reasons",
    },
    FlagSpec {
        id: 12,
        name: "zero-flooded-area",
        trigger: "computation succeeded and flooded area is zero",
    },
    FlagSpec {
        id: 13,
        name: "country-mismatch",
        trigger: "matched polygon's country differs from the record's country",
    },
    FlagSpec {
        id: 14,
        name: "low-clear-fraction",
        trigger: "cloud-clear fraction below the configured minimum",
    },
    FlagSpec {
        id: 15,
        name: "no-valid-pixels",
        trigger: "zero valid pixels; no usable imagery in the window",
    },
];

impl QualityFlag {
    pub const ALL: [QualityFlag; 15] = [
        QualityFlag::StartDayEstimated,
        QualityFlag::EndDayEstimated,
        QualityFlag::PredatesImagery,
        QualityFlag::FloodMapUnavailable,
        QualityFlag::PopulationUnavailable,
        QualityFlag::GridMismatch,
        QualityFlag::ImpactsSplitByPopulation,
        QualityFlag::ImpactsDirectlyReported,
        QualityFlag::MissingEventDates,
        QualityFlag::MissingAdminUnits,
        QualityFlag::UnprocessedOther,
        QualityFlag::ZeroFloodedArea,
        QualityFlag::CountryMismatch,
        QualityFlag::LowClearFraction,
        QualityFlag::NoValidPixels,
    ];

    /// Published numeric id (1-15)
    pub fn id(self) -> u8 {
        Self::ALL.iter().position(|&f| f == self).unwrap() as u8 + 1
    }

    pub fn spec(self) -> &'static FlagSpec {
        &SCHEMA[usize::from(self.id()) - 1]
    }
}

impl std::fmt::Display for QualityFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.spec().name)
    }
}

/// Thresholds the flag engine evaluates against
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityThresholds {
    /// Clear-observation fractions below this raise flag 14
    pub min_clear_fraction: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_clear_fraction: 0.25,
        }
    }
}

/// Everything the flag engine looks at: event-record completeness, raster
/// and population provenance, and the disaggregation method. Assembled by
/// the batch runner from the event record and processing outputs.
#[derive(Debug, Clone, Default)]
pub struct FlagContext {
    pub start_day_estimated: bool,
    pub end_day_estimated: bool,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub has_admin_units: bool,
    /// False for records the pipeline never processed (flags 9-11)
    pub processed: bool,
    pub allocation: Option<AllocationMethod>,
    pub flood_map_available: bool,
    pub population_available: bool,
    pub grid_mismatch: bool,
    /// Country reported by the source disaster record
    pub record_country: String,
    /// Country of the matched polygon per the boundary dataset
    pub boundary_country: String,
    pub adm1_code: i64,
    pub flooded_area_km2: Option<f64>,
    pub clear_fraction: Option<f64>,
    pub no_valid_pixels: bool,
}

/// Admin1 codes whose boundary-dataset country assignment is known to
/// disagree with disaster records; the boundary dataset wins. Mismatches
/// explained by this table do not raise flag 13.
const COUNTRY_CORRECTIONS: &[(i64, &str)] = &[
    (2720, "Spain"),
    (2961, "Timor-Leste"),
    (25351, "Montenegro"),
    (25355, "Montenegro"),
    (25356, "Montenegro"),
    (25365, "Montenegro"),
    (25372, "Serbia"),
    (25373, "Serbia"),
    (25375, "Serbia"),
    (25376, "Serbia"),
    (25378, "Serbia"),
    (25379, "Serbia"),
    (25381, "Serbia"),
    (25385, "Serbia"),
    (25389, "Serbia"),
    (25394, "Serbia"),
    (25395, "Serbia"),
    (40408, "Jammu and Kashmir"),
    (40409, "Jammu and Kashmir"),
    (40422, "Jammu and Kashmir"),
    (40423, "Jammu and Kashmir"),
    (40424, "Jammu and Kashmir"),
    (40425, "Jammu and Kashmir"),
    (40426, "Jammu and Kashmir"),
    (40427, "Jammu and Kashmir"),
    (40428, "Jammu and Kashmir"),
    (40429, "Jammu and Kashmir"),
    (40430, "Jammu and Kashmir"),
    (40431, "Jammu and Kashmir"),
];

/// Country to attribute an admin1 unit to, after known corrections
pub fn corrected_country<'a>(adm1_code: i64, boundary_country: &'a str) -> &'a str {
    COUNTRY_CORRECTIONS
        .iter()
        .find(|(code, _)| *code == adm1_code)
        .map(|(_, country)| *country)
        .unwrap_or(boundary_country)
}

/// Assign quality flags for one event.
///
/// A fixed ordered list of independent checks, each yielding zero or one
/// flags; a pure function of the context, so re-evaluation on the same
/// inputs reproduces the same set.
pub fn assign_flags(ctx: &FlagContext, thresholds: &QualityThresholds) -> BTreeSet<QualityFlag> {
    let mut flags = BTreeSet::new();

    if ctx.start_day_estimated {
        flags.insert(QualityFlag::StartDayEstimated);
    }
    if ctx.end_day_estimated {
        flags.insert(QualityFlag::EndDayEstimated);
    }
    if let Some(start) = ctx.start_date {
        if start < mission_start() {
            flags.insert(QualityFlag::PredatesImagery);
        }
    }

    if ctx.processed {
        if !ctx.flood_map_available {
            flags.insert(QualityFlag::FloodMapUnavailable);
        }
        if !ctx.population_available {
            flags.insert(QualityFlag::PopulationUnavailable);
        }
        if ctx.grid_mismatch {
            flags.insert(QualityFlag::GridMismatch);
        }
        match ctx.allocation {
            Some(AllocationMethod::PopulationWeighted) => {
                flags.insert(QualityFlag::ImpactsSplitByPopulation);
            }
            Some(AllocationMethod::DirectReported) => {
                flags.insert(QualityFlag::ImpactsDirectlyReported);
            }
            None => {}
        }
    } else {
        let dates_missing = ctx.start_date.is_none() || ctx.end_date.is_none();
        if dates_missing {
            flags.insert(QualityFlag::MissingEventDates);
        }
        if !ctx.has_admin_units {
            flags.insert(QualityFlag::MissingAdminUnits);
        }
        if !dates_missing && ctx.has_admin_units {
            flags.insert(QualityFlag::UnprocessedOther);
        }
    }

    if let Some(area) = ctx.flooded_area_km2 {
        if area == 0.0 && !ctx.no_valid_pixels {
            flags.insert(QualityFlag::ZeroFloodedArea);
        }
    }

    if ctx.processed {
        let effective = corrected_country(ctx.adm1_code, &ctx.boundary_country);
        if !ctx.record_country.is_empty() && ctx.record_country != effective {
            flags.insert(QualityFlag::CountryMismatch);
        }
    }

    if let Some(clear) = ctx.clear_fraction {
        if clear < thresholds.min_clear_fraction {
            flags.insert(QualityFlag::LowClearFraction);
        }
    }
    if ctx.processed && ctx.no_valid_pixels {
        flags.insert(QualityFlag::NoValidPixels);
    }

    flags
}
