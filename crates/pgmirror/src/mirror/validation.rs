//! Pre-submission checks for inserts and updates

use crate::error::ValidationError;
use crate::schema::TableDescriptor;
use pgmirror_api::MirroredItem;

/// Reason code of [`RequiredFields`]
pub const MISSING_REQUIRED_FIELD: i32 = 1;

/// Decides whether an item may be written.
///
/// A rejected item never reaches the connector; the error's code is the
/// non-zero reason and its message is kept as the manager's last check
/// message.
pub trait ItemValidator: Send + Sync {
    fn check_valid(&self, item: &MirroredItem) -> Result<(), ValidationError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl ItemValidator for AcceptAll {
    fn check_valid(&self, _item: &MirroredItem) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Rejects items whose required fields are missing or NULL
#[derive(Debug, Clone, Default)]
pub struct RequiredFields {
    fields: Vec<String>,
}

impl RequiredFields {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_descriptor(descriptor: &TableDescriptor) -> Self {
        Self::new(
            descriptor
                .fields()
                .iter()
                .filter(|f| f.required)
                .map(|f| f.name.clone()),
        )
    }
}

impl ItemValidator for RequiredFields {
    fn check_valid(&self, item: &MirroredItem) -> Result<(), ValidationError> {
        let missing: Vec<&str> = self
            .fields
            .iter()
            .filter(|name| item.get(name).map_or(true, |v| v.is_null()))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::new(
                MISSING_REQUIRED_FIELD,
                format!("missing required field(s): {}", missing.join(", ")),
            ))
        }
    }
}

/// Validator from a closure
pub struct FnValidator<F>(pub F);

impl<F> ItemValidator for FnValidator<F>
where
    F: Fn(&MirroredItem) -> Result<(), ValidationError> + Send + Sync,
{
    fn check_valid(&self, item: &MirroredItem) -> Result<(), ValidationError> {
        (self.0)(item)
    }
}
