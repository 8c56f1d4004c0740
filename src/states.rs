//! Closed state vocabularies for the planning and daily-operations layers.
//!
//! The legacy importer wrote free-form string tags ('T', 'L', 'P', 'LIC',
//! 'planificado', ...). Each layer now has one enumerated type, and the
//! mapping from the legacy tags is total and lives here so the db migration
//! and the tests share a single source of truth.

/// Monthly plan cell. `Unset` is represented in the store by the absence of
/// a row; it never round-trips through `as_str`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanState {
    Scheduled,
    Off,
    Unset,
}

impl PlanState {
    pub fn as_str(self) -> Option<&'static str> {
        match self {
            PlanState::Scheduled => Some("scheduled"),
            PlanState::Off => Some("off"),
            PlanState::Unset => None,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(PlanState::Scheduled),
            "off" => Some(PlanState::Off),
            "unset" => Some(PlanState::Unset),
            _ => None,
        }
    }

    /// Wire label, with `unset` spelled out for grid payloads.
    pub fn wire(self) -> &'static str {
        match self {
            PlanState::Scheduled => "scheduled",
            PlanState::Off => "off",
            PlanState::Unset => "unset",
        }
    }
}

/// Daily override: what actually happened at a post on one date,
/// independent of the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideState {
    Attended,
    AbsentReplaced,
    AbsentUncovered,
    Leave,
    Vacation,
    MedicalLeave,
}

impl OverrideState {
    pub fn as_str(self) -> &'static str {
        match self {
            OverrideState::Attended => "attended",
            OverrideState::AbsentReplaced => "absent_replaced",
            OverrideState::AbsentUncovered => "absent_uncovered",
            OverrideState::Leave => "leave",
            OverrideState::Vacation => "vacation",
            OverrideState::MedicalLeave => "medical_leave",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "attended" => Some(OverrideState::Attended),
            "absent_replaced" => Some(OverrideState::AbsentReplaced),
            "absent_uncovered" => Some(OverrideState::AbsentUncovered),
            "leave" => Some(OverrideState::Leave),
            "vacation" => Some(OverrideState::Vacation),
            "medical_leave" => Some(OverrideState::MedicalLeave),
            _ => None,
        }
    }

    /// Camel-case name used in request params and responses.
    pub fn wire(self) -> &'static str {
        match self {
            OverrideState::Attended => "attended",
            OverrideState::AbsentReplaced => "absentReplaced",
            OverrideState::AbsentUncovered => "absentUncovered",
            OverrideState::Leave => "leave",
            OverrideState::Vacation => "vacation",
            OverrideState::MedicalLeave => "medicalLeave",
        }
    }

    /// The titular guard is not working their own slot that day. Such a day
    /// no longer claims the guard for conflict purposes.
    pub fn releases_titular(self) -> bool {
        !matches!(self, OverrideState::Attended)
    }
}

/// Kind of paid ad-hoc coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftKind {
    Replacement,
    VacantFill,
}

impl ShiftKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ShiftKind::Replacement => "replacement",
            ShiftKind::VacantFill => "vacant_fill",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "replacement" => Some(ShiftKind::Replacement),
            "vacant_fill" => Some(ShiftKind::VacantFill),
            _ => None,
        }
    }
}

/// Payment lifecycle of an extra-shift ledger entry. `Paid` and `Reversed`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayStatus {
    Unpaid,
    Batched,
    Paid,
    Reversed,
}

impl PayStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PayStatus::Unpaid => "unpaid",
            PayStatus::Batched => "batched",
            PayStatus::Paid => "paid",
            PayStatus::Reversed => "reversed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unpaid" => Some(PayStatus::Unpaid),
            "batched" => Some(PayStatus::Batched),
            "paid" => Some(PayStatus::Paid),
            "reversed" => Some(PayStatus::Reversed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PayStatus::Paid | PayStatus::Reversed)
    }
}

/// Resolved display state for one (post, date), after layering the
/// override and any coverage assignment over the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayState {
    Attended,
    AbsentReplaced,
    AbsentUncovered,
    Leave,
    Vacation,
    MedicalLeave,
    VacantCovered,
    OnShiftUnconfirmed,
    Off,
}

impl DisplayState {
    pub fn wire(self) -> &'static str {
        match self {
            DisplayState::Attended => "attended",
            DisplayState::AbsentReplaced => "absentReplaced",
            DisplayState::AbsentUncovered => "absentUncovered",
            DisplayState::Leave => "leave",
            DisplayState::Vacation => "vacation",
            DisplayState::MedicalLeave => "medicalLeave",
            DisplayState::VacantCovered => "vacantCovered",
            DisplayState::OnShiftUnconfirmed => "onShiftUnconfirmed",
            DisplayState::Off => "off",
        }
    }

    pub fn from_override(o: OverrideState) -> Self {
        match o {
            OverrideState::Attended => DisplayState::Attended,
            OverrideState::AbsentReplaced => DisplayState::AbsentReplaced,
            OverrideState::AbsentUncovered => DisplayState::AbsentUncovered,
            OverrideState::Leave => DisplayState::Leave,
            OverrideState::Vacation => DisplayState::Vacation,
            OverrideState::MedicalLeave => DisplayState::MedicalLeave,
        }
    }
}

/// Resolution order for one (post, date). Highest priority first:
/// override, then vacant-post coverage, then the plan.
pub fn resolve_display(
    plan: PlanState,
    override_state: Option<OverrideState>,
    has_coverage: bool,
    post_is_open: bool,
) -> DisplayState {
    if let Some(o) = override_state {
        return DisplayState::from_override(o);
    }
    if post_is_open && has_coverage {
        return DisplayState::VacantCovered;
    }
    match plan {
        PlanState::Scheduled => DisplayState::OnShiftUnconfirmed,
        PlanState::Off | PlanState::Unset => DisplayState::Off,
    }
}

/// Legacy plan-layer tags as written by the v0 importer.
pub fn plan_from_legacy(code: &str) -> Option<PlanState> {
    match code.trim().to_ascii_uppercase().as_str() {
        "P" | "PLANIFICADO" => Some(PlanState::Scheduled),
        "L" | "LIBRE" | "DESCANSO" => Some(PlanState::Off),
        _ => None,
    }
}

/// Legacy override-layer tags. 'T' trabajado, 'R' reemplazo, 'F' falta,
/// 'PER' permiso, 'V' vacaciones, 'LIC' licencia medica.
pub fn override_from_legacy(code: &str) -> Option<OverrideState> {
    match code.trim().to_ascii_uppercase().as_str() {
        "T" | "TRABAJADO" => Some(OverrideState::Attended),
        "R" | "REEMPLAZO" => Some(OverrideState::AbsentReplaced),
        "F" | "FALTA" => Some(OverrideState::AbsentUncovered),
        "PER" | "PERMISO" => Some(OverrideState::Leave),
        "V" | "VACACIONES" => Some(OverrideState::Vacation),
        "LIC" | "LICENCIA" => Some(OverrideState::MedicalLeave),
        _ => None,
    }
}
