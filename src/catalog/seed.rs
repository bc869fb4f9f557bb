//! Startup catalog seeding from a JSON file.
//!
//! The file is a JSON array of templates. Interactive entries without a
//! declared option set get one inferred from the body.

use std::path::Path;

use tracing::{info, warn};

use crate::catalog::{MessageTemplate, OptionSet};
use crate::error::{ConfigError, DatabaseError, Error};
use crate::store::Database;

/// Parse seed JSON, validating each template and filling in inferred options.
pub fn parse_seed(json: &str) -> Result<Vec<MessageTemplate>, ConfigError> {
    let mut templates: Vec<MessageTemplate> = serde_json::from_str(json)
        .map_err(|e| ConfigError::ParseError(format!("catalog seed: {e}")))?;

    for template in &mut templates {
        template
            .validate()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if template.is_interactive() && template.options.is_empty() {
            let inferred = OptionSet::infer_from_body(&template.body);
            if inferred.is_empty() {
                warn!(
                    template_id = %template.id,
                    "Interactive template has no declared or inferable options"
                );
            } else {
                warn!(
                    template_id = %template.id,
                    options = %inferred.to_db(),
                    "Interactive template has no declared options; inferred from body"
                );
            }
            template.options = inferred;
        }
    }
    Ok(templates)
}

/// Load a seed file into the catalog. Returns the number of templates written.
///
/// Templates that already have deliveries and would change content are left
/// alone with a warning.
pub async fn load_seed(store: &dyn Database, path: &Path) -> Result<usize, Error> {
    let json = tokio::fs::read_to_string(path)
        .await
        .map_err(ConfigError::from)?;
    let templates = parse_seed(&json)?;

    let mut written = 0;
    for template in &templates {
        match store.upsert_template(template).await {
            Ok(()) => written += 1,
            Err(DatabaseError::Constraint(reason)) => {
                warn!(template_id = %template.id, "Seed entry skipped: {reason}");
            }
            Err(e) => return Err(e.into()),
        }
    }

    info!(path = %path.display(), written, total = templates.len(), "Catalog seeded");
    Ok(written)
}
