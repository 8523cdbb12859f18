//! Parameter preparation: seed every declared parameter, auto-fill from the
//! selected customer, and validate required fields before any send.

use std::collections::{BTreeMap, BTreeSet};

use skillrun_core::{
    CustomerId, DocumentId, ParameterSpec, ParameterValue, ParameterValues, Skill, TeamId,
};
use tracing::debug;

use crate::error::{FieldError, ValidationError};

/// Parameter names filled with the customer's name.
const NAME_FIELDS: &[&str] = &["company_name", "customer_name"];

/// Parameter names filled with the customer's industry.
const INDUSTRY_FIELDS: &[&str] = &[
    "industry",
    "industry_type",
    "sector",
    "business_industry",
    "customer_industry",
    "company_industry",
];

/// Parameter names filled with the customer's company size.
const SIZE_FIELDS: &[&str] = &[
    "company_size",
    "size",
    "employee_count",
    "team_size",
    "organization_size",
    "business_size",
];

/// The customer currently selected on the surface, if any.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CustomerContext {
    pub id: Option<CustomerId>,
    pub name: Option<String>,
    pub industry: Option<String>,
    pub company_size: Option<String>,
}

/// Everything outside the form that shapes an execution.
#[derive(Clone, Debug, PartialEq)]
pub struct AmbientContext {
    pub team_id: TeamId,
    pub customer: Option<CustomerContext>,
    pub reference_document: Option<DocumentId>,
}

impl AmbientContext {
    pub fn new(team_id: TeamId) -> Self {
        Self {
            team_id,
            customer: None,
            reference_document: None,
        }
    }

    pub fn customer_id(&self) -> Option<CustomerId> {
        self.customer.as_ref().and_then(|c| c.id.clone())
    }

    /// Auto-fill text for a parameter name. Name beats industry beats size.
    fn autofill_for(&self, name: &str) -> Option<&str> {
        let customer = self.customer.as_ref()?;
        pick(name, NAME_FIELDS, &customer.name)
            .or_else(|| pick(name, INDUSTRY_FIELDS, &customer.industry))
            .or_else(|| pick(name, SIZE_FIELDS, &customer.company_size))
    }
}

fn pick<'a>(name: &str, aliases: &[&str], value: &'a Option<String>) -> Option<&'a str> {
    if aliases.iter().any(|alias| *alias == name) {
        value.as_deref().filter(|v| !v.is_empty())
    } else {
        None
    }
}

/// Result of [`validate`]: empty `errors` means valid.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Validation {
    pub errors: BTreeMap<String, FieldError>,
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_result(self) -> Result<(), ValidationError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(ValidationError {
                fields: self.errors,
            })
        }
    }
}

/// Seeded and auto-filled values for `skill`.
pub fn prepare(skill: &Skill, ctx: &AmbientContext) -> ParameterValues {
    ParameterForm::prepare(skill, ctx).into_values()
}

/// A required parameter is invalid when absent, null, an empty string or an empty list.
pub fn validate(skill: &Skill, values: &ParameterValues) -> Validation {
    check_required(&skill.parameters, values)
}

fn check_required(specs: &[ParameterSpec], values: &ParameterValues) -> Validation {
    let errors = specs
        .iter()
        .filter(|spec| spec.required)
        .filter(|spec| values.get(&spec.name).map_or(true, ParameterValue::is_empty))
        .map(|spec| (spec.name.clone(), FieldError::Required))
        .collect();
    Validation { errors }
}

/// Editable parameter values for one skill. Tracks which fields the user
/// touched so auto-fill never overwrites them.
#[derive(Clone, Debug)]
pub struct ParameterForm {
    specs: Vec<ParameterSpec>,
    values: ParameterValues,
    edited: BTreeSet<String>,
}

impl ParameterForm {
    /// Every declared parameter seeded with its default or the empty value for its type.
    pub fn new(skill: &Skill) -> Self {
        let values = skill
            .parameters
            .iter()
            .map(|spec| (spec.name.clone(), spec.seed_value()))
            .collect();
        Self {
            specs: skill.parameters.clone(),
            values,
            edited: BTreeSet::new(),
        }
    }

    pub fn prepare(skill: &Skill, ctx: &AmbientContext) -> Self {
        let mut form = Self::new(skill);
        form.autofill(ctx);
        form
    }

    /// Apply contextual auto-fill to every field the user has not edited.
    /// Called again whenever the selected customer changes.
    pub fn autofill(&mut self, ctx: &AmbientContext) -> usize {
        let mut filled = 0;
        for spec in &self.specs {
            if self.edited.contains(&spec.name) {
                continue;
            }
            if let Some(value) = ctx.autofill_for(&spec.name) {
                self.values
                    .insert(spec.name.clone(), ParameterValue::parse_as(spec.kind, value));
                filled += 1;
            }
        }
        if filled > 0 {
            debug!(filled, "parameters auto-filled from customer");
        }
        filled
    }

    /// Record a user edit. Returns `false` for an undeclared parameter.
    pub fn set(&mut self, name: &str, value: impl Into<ParameterValue>) -> bool {
        if !self.specs.iter().any(|s| s.name == name) {
            return false;
        }
        self.values.insert(name.to_string(), value.into());
        self.edited.insert(name.to_string());
        true
    }

    /// Record a user edit from raw text, interpreted by the declared type.
    pub fn set_raw(&mut self, name: &str, raw: &str) -> bool {
        let Some(kind) = self.specs.iter().find(|s| s.name == name).map(|s| s.kind) else {
            return false;
        };
        self.set(name, ParameterValue::parse_as(kind, raw))
    }

    pub fn is_edited(&self, name: &str) -> bool {
        self.edited.contains(name)
    }

    pub fn values(&self) -> &ParameterValues {
        &self.values
    }

    pub fn validate(&self) -> Validation {
        check_required(&self.specs, &self.values)
    }

    pub fn into_values(self) -> ParameterValues {
        self.values
    }
}
