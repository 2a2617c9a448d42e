//! Verify command implementation.

use ormctx_core::StreamSummary;
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of checks run.
    pub checks_run: usize,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Records that `section` holds no more items than `table`.
    fn check_within(&mut self, summary: &StreamSummary, section: &str, table: &str) {
        self.checks_run += 1;
        let held = summary.section(section).unwrap_or(0);
        let available = summary.table(table).unwrap_or(0);
        if held > available {
            self.errors.push(format!(
                "{section} holds {held} items but the {table} table only has {available}"
            ));
        }
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying stream at {:?}", path);
    println!();

    let bytes = std::fs::read(path)?;
    let result = verify(&bytes);

    println!("Checks run: {}", result.checks_run);
    for error in &result.errors {
        println!("  ERROR: {error}");
    }

    println!();
    if result.is_ok() {
        println!("✓ Stream verification passed");
        Ok(())
    } else {
        println!("✗ Stream verification failed");
        Err("Verification failed".into())
    }
}

/// Checks item shapes and the section counts against the object tables.
pub fn verify(bytes: &[u8]) -> VerifyResult {
    let mut result = VerifyResult {
        checks_run: 1,
        ..VerifyResult::default()
    };
    let summary = match StreamSummary::read(bytes) {
        Ok(summary) => summary,
        Err(e) => {
            result.errors.push(e.to_string());
            return result;
        }
    };

    // every managed entity and entry refers to one table row
    result.check_within(&summary, "entities_by_key", "entities");
    result.check_within(&summary, "entity_entries", "entities");
    result.check_within(&summary, "collections_by_key", "collections");
    result.check_within(&summary, "collection_entries", "collections");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_fails_the_first_check() {
        let result = verify(b"not a stream");
        assert!(!result.is_ok());
        assert_eq!(result.checks_run, 1);
    }

    #[test]
    fn passivated_contexts_pass() {
        let model = ormctx_testkit::library();
        let session = ormctx_testkit::TestSession::open(&model);
        let ctx = ormctx_core::PersistenceContext::new(&session.handle());
        let result = verify(&ctx.serialize().unwrap());
        assert!(result.is_ok(), "{:?}", result.errors);
        assert_eq!(result.checks_run, 5);
    }

    #[test]
    fn empty_input_fails() {
        assert!(!verify(&[]).is_ok());
    }
}
