//! Loop and cycle guard.
//!
//! Resubmitted tasks feed back into the orchestrator when they finish. These
//! checks keep that loop bounded: machine-generated options are never
//! re-triggered, extracted configs end the chain, and unpack jobs do not spawn
//! further unpack jobs.

use super::rules::{Package, ParentPackage};
use crate::models::AnalysisResult;
use crate::options::OptionString;
use thiserror::Error;

/// Why a finished task gets no follow-up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("target {0:?} is a test fixture")]
    TestFixture(String),

    #[error("result carries the {0:?} section, deferring to the custom extractor")]
    DeferredToExtractor(String),

    #[error("task has no options")]
    NoOptions,

    #[error("options were generated by a previous resubmission")]
    AutoGenerated,

    #[error("a config was already extracted")]
    ConfigExtracted,

    #[error("resubmission disabled by options")]
    Disabled,

    #[error("no stored sample path to resubmit")]
    NoTarget,

    #[error("parent already ran the unpacker {0}")]
    UnpackerChain(Package),

    #[error("parent already ran the specialized package {0}")]
    Specialized(Package),
}

/// Termination checks for one orchestrator run.
#[derive(Debug, Clone, Default)]
pub struct LoopGuard {
    /// Report section whose presence hands the job to a custom extractor.
    keyword: Option<String>,
    /// Filename fragments marking internal test samples.
    skip_filenames: Vec<String>,
}

impl LoopGuard {
    pub fn new(keyword: Option<String>, skip_filenames: Vec<String>) -> Self {
        Self {
            keyword: keyword.filter(|k| !k.is_empty()),
            skip_filenames,
        }
    }

    /// Checks that apply before any detection is looked at.
    pub fn check_result(&self, result: &AnalysisResult) -> Result<(), Rejection> {
        let filename = result.file_name();
        if self
            .skip_filenames
            .iter()
            .any(|fragment| !fragment.is_empty() && filename.contains(fragment.as_str()))
        {
            return Err(Rejection::TestFixture(filename.to_string()));
        }

        if let Some(keyword) = &self.keyword {
            if result.has_section(keyword) {
                return Err(Rejection::DeferredToExtractor(keyword.clone()));
            }
        }

        if result.info.options.is_empty() {
            return Err(Rejection::NoOptions);
        }

        if result.info.options.contains_key("auto") {
            return Err(Rejection::AutoGenerated);
        }

        if result.has_extracted_config() {
            return Err(Rejection::ConfigExtracted);
        }

        if result.target_path().is_none() {
            return Err(Rejection::NoTarget);
        }

        Ok(())
    }

    /// A breakpoint-driven unpack job must not spawn another one.
    pub fn check_breakpoint_path(&self, parent: &ParentPackage<'_>) -> Result<(), Rejection> {
        match parent.specialized() {
            Some(package) if package.is_unpacker() => Err(Rejection::UnpackerChain(package)),
            _ => Ok(()),
        }
    }

    /// Checks before package selection runs.
    pub fn check_selection_path(&self, options: &OptionString) -> Result<(), Rejection> {
        if options.has_flag("disable_cape", "1") {
            return Err(Rejection::Disabled);
        }
        Ok(())
    }

    /// Fallback jobs only run for generic parents.
    pub fn check_fallback(&self, parent: &ParentPackage<'_>) -> Result<(), Rejection> {
        match parent.specialized() {
            Some(package) => Err(Rejection::Specialized(package)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn guard() -> LoopGuard {
        LoopGuard::new(
            Some("tr_extractor".to_string()),
            vec!["_test_00".to_string(), "danabot".to_string()],
        )
    }

    fn result(value: serde_json::Value) -> AnalysisResult {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_plain_result_passes() {
        let result = result(json!({
            "info": {"options": "procdump=1"},
            "target": {"file": {"name": "sample.exe", "path": "/tmp/sample.exe"}}
        }));
        assert_eq!(guard().check_result(&result), Ok(()));
    }

    #[test]
    fn test_rejects_test_fixtures() {
        let result = result(json!({"target": {"file": {"name": "x_test_00.exe"}}}));
        assert!(matches!(
            guard().check_result(&result),
            Err(Rejection::TestFixture(_))
        ));
    }

    #[test]
    fn test_rejects_keyword_section() {
        let result = result(json!({
            "tr_extractor": {},
            "target": {"file": {"name": "a.exe"}}
        }));
        assert_eq!(
            guard().check_result(&result),
            Err(Rejection::DeferredToExtractor("tr_extractor".to_string()))
        );
    }

    #[test]
    fn test_rejects_auto_generated_options() {
        let result = result(json!({
            "info": {"options": "auto=1,bp0=10"},
            "target": {"file": {"name": "a.exe"}}
        }));
        assert_eq!(guard().check_result(&result), Err(Rejection::AutoGenerated));
    }

    #[test]
    fn test_rejects_extracted_config() {
        let result = result(json!({
            "info": {"options": "procdump=1"},
            "target": {"file": {"name": "a.exe"}},
            "CAPE": [{"cape_config": {"C2": "evil.example"}}]
        }));
        assert_eq!(guard().check_result(&result), Err(Rejection::ConfigExtracted));
    }

    #[test]
    fn test_rejects_empty_options() {
        for options in [json!(""), json!(null), json!({})] {
            let result = result(json!({
                "info": {"options": options},
                "target": {"file": {"name": "a.exe", "path": "/tmp/a.exe"}}
            }));
            assert_eq!(guard().check_result(&result), Err(Rejection::NoOptions));
        }
    }

    #[test]
    fn test_rejects_name_without_stored_path() {
        let result = result(json!({
            "info": {"options": "procdump=1"},
            "target": {"file": {"name": "a.exe"}}
        }));
        assert_eq!(guard().check_result(&result), Err(Rejection::NoTarget));
    }

    #[test]
    fn test_unpacker_chain_is_refused() {
        let guard = guard();
        let unpacker = ParentPackage::parse(Some("Unpacker"));
        assert_eq!(
            guard.check_breakpoint_path(&unpacker),
            Err(Rejection::UnpackerChain(Package::Unpacker))
        );
        assert_eq!(
            guard.check_breakpoint_path(&ParentPackage::parse(Some("PlugX"))),
            Ok(())
        );
    }

    #[test]
    fn test_disable_flag_and_fallback() {
        let guard = guard();
        assert_eq!(
            guard.check_selection_path(&OptionString::parse("disable_cape=1")),
            Err(Rejection::Disabled)
        );
        assert_eq!(
            guard.check_selection_path(&OptionString::parse("disable_cape=0")),
            Ok(())
        );
        assert!(guard.check_fallback(&ParentPackage::parse(Some("exe"))).is_ok());
        assert!(guard
            .check_fallback(&ParentPackage::parse(Some("TrickBot")))
            .is_err());
    }
}
