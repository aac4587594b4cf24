//! Package selection rules.
//!
//! The follow-up package is picked from a closed set of family and unpacker
//! packages. Every table is an exhaustive `match` so adding a family means
//! adding a variant and handling it everywhere.

use super::aggregator::DetectionSet;
use crate::models::Signature;
use std::fmt;
use tracing::debug;

/// Specialized analysis packages this orchestrator may submit to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Package {
    Emotet,
    EmotetDoc,
    Unpacker,
    UnpackerDll,
    UnpackerRegsvr,
    UnpackerZip,
    UnpackerPs1,
    UnpackerJs,
    Hancitor,
    HancitorDll,
    HancitorDoc,
    PlugX,
    PlugXPayload,
    PlugXDll,
    PlugXDoc,
    PlugXZip,
    RegBinary,
    ShellcodeExtraction,
    TrickBot,
    TrickBotDoc,
    Upx,
    UpxDll,
}

impl Package {
    pub const ALL: [Package; 22] = [
        Package::Emotet,
        Package::EmotetDoc,
        Package::Unpacker,
        Package::UnpackerDll,
        Package::UnpackerRegsvr,
        Package::UnpackerZip,
        Package::UnpackerPs1,
        Package::UnpackerJs,
        Package::Hancitor,
        Package::HancitorDll,
        Package::HancitorDoc,
        Package::PlugX,
        Package::PlugXPayload,
        Package::PlugXDll,
        Package::PlugXDoc,
        Package::PlugXZip,
        Package::RegBinary,
        Package::ShellcodeExtraction,
        Package::TrickBot,
        Package::TrickBotDoc,
        Package::Upx,
        Package::UpxDll,
    ];

    /// Name the scheduler knows the package by.
    pub fn name(self) -> &'static str {
        match self {
            Package::Emotet => "Emotet",
            Package::EmotetDoc => "Emotet_doc",
            Package::Unpacker => "Unpacker",
            Package::UnpackerDll => "Unpacker_dll",
            Package::UnpackerRegsvr => "Unpacker_regsvr",
            Package::UnpackerZip => "Unpacker_zip",
            Package::UnpackerPs1 => "Unpacker_ps1",
            Package::UnpackerJs => "Unpacker_js",
            Package::Hancitor => "Hancitor",
            Package::HancitorDll => "Hancitor_dll",
            Package::HancitorDoc => "Hancitor_doc",
            Package::PlugX => "PlugX",
            Package::PlugXPayload => "PlugXPayload",
            Package::PlugXDll => "PlugX_dll",
            Package::PlugXDoc => "PlugX_doc",
            Package::PlugXZip => "PlugX_zip",
            Package::RegBinary => "RegBinary",
            Package::ShellcodeExtraction => "Shellcode-Extraction",
            Package::TrickBot => "TrickBot",
            Package::TrickBotDoc => "TrickBot_doc",
            Package::Upx => "UPX",
            Package::UpxDll => "UPX_dll",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    /// Generic unpackers, which must never spawn another unpack job.
    pub fn is_unpacker(self) -> bool {
        matches!(
            self,
            Package::Unpacker
                | Package::UnpackerDll
                | Package::UnpackerRegsvr
                | Package::UnpackerZip
                | Package::UnpackerPs1
                | Package::UnpackerJs
        )
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Generic packages the family tables are keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasePackage {
    Exe,
    Dll,
    Doc,
    Zip,
    Js,
    Ps1,
    Regsvr,
}

impl BasePackage {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "exe" => Some(BasePackage::Exe),
            "dll" => Some(BasePackage::Dll),
            "doc" => Some(BasePackage::Doc),
            "zip" => Some(BasePackage::Zip),
            "js" => Some(BasePackage::Js),
            "ps1" => Some(BasePackage::Ps1),
            "regsvr" => Some(BasePackage::Regsvr),
            _ => None,
        }
    }
}

/// The package the finished task ran under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentPackage<'a> {
    Absent,
    Specialized(Package),
    Generic {
        name: &'a str,
        base: Option<BasePackage>,
    },
}

impl<'a> ParentPackage<'a> {
    pub fn parse(name: Option<&'a str>) -> Self {
        match name.filter(|n| !n.is_empty()) {
            None => ParentPackage::Absent,
            Some(name) => match Package::from_name(name) {
                Some(package) => ParentPackage::Specialized(package),
                None => ParentPackage::Generic {
                    name,
                    base: BasePackage::from_name(name),
                },
            },
        }
    }

    pub fn name(&self) -> &'a str {
        match self {
            ParentPackage::Absent => "",
            ParentPackage::Specialized(package) => package.name(),
            ParentPackage::Generic { name, .. } => name,
        }
    }

    pub fn base(&self) -> Option<BasePackage> {
        match self {
            ParentPackage::Generic { base, .. } => *base,
            _ => None,
        }
    }

    pub fn specialized(&self) -> Option<Package> {
        match self {
            ParentPackage::Specialized(package) => Some(*package),
            _ => None,
        }
    }

    pub fn is_unpacker(&self) -> bool {
        self.specialized().is_some_and(Package::is_unpacker)
    }

    /// Whether submitting `package` would just repeat the parent task.
    pub fn is(&self, package: Package) -> bool {
        self.specialized() == Some(package)
    }
}

/// Families recognised from static hits without options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    TrickBot,
    Hancitor,
    /// Large binary registry values.
    RegBinary,
}

impl Family {
    /// Order in which static detections decide the package.
    pub const PRIORITY: [Family; 3] = [Family::TrickBot, Family::Hancitor, Family::RegBinary];

    pub fn from_hit_name(name: &str) -> Option<Self> {
        match name {
            "TrickBot" => Some(Family::TrickBot),
            "Hancitor" => Some(Family::Hancitor),
            "RegBinary" => Some(Family::RegBinary),
            _ => None,
        }
    }

    /// Label recorded in the detection set, also used for fallback dumper jobs.
    pub fn label(self) -> Package {
        match self {
            Family::TrickBot => Package::TrickBot,
            Family::Hancitor => Package::Hancitor,
            Family::RegBinary => Package::RegBinary,
        }
    }

    /// Family package for the given parent.
    pub fn package_for(self, parent: &ParentPackage<'_>) -> Option<Package> {
        match (self, parent.base()) {
            (Family::TrickBot, Some(BasePackage::Doc)) => Some(Package::TrickBotDoc),
            (Family::TrickBot, Some(BasePackage::Exe)) => Some(Package::TrickBot),
            (Family::TrickBot, _) => None,
            (Family::Hancitor, Some(BasePackage::Doc)) => Some(Package::HancitorDoc),
            (Family::Hancitor, Some(BasePackage::Exe)) => Some(Package::Hancitor),
            (Family::Hancitor, Some(BasePackage::Dll)) => Some(Package::HancitorDll),
            (Family::Hancitor, _) => None,
            (Family::RegBinary, _) => Some(Package::RegBinary),
        }
    }
}

/// Behavioral signatures that drive package selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BehaviorSignature {
    Unpacker,
    PlugX,
}

impl BehaviorSignature {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Unpacker" => Some(BehaviorSignature::Unpacker),
            "PlugX" => Some(BehaviorSignature::PlugX),
            _ => None,
        }
    }
}

/// Generic unpacker for a parent package. Documents are never unpacked.
pub fn unpacker_for(base: BasePackage) -> Option<Package> {
    match base {
        BasePackage::Exe => Some(Package::Unpacker),
        BasePackage::Dll => Some(Package::UnpackerDll),
        BasePackage::Regsvr => Some(Package::UnpackerRegsvr),
        BasePackage::Zip => Some(Package::UnpackerZip),
        BasePackage::Js => Some(Package::UnpackerJs),
        BasePackage::Ps1 => Some(Package::UnpackerPs1),
        BasePackage::Doc => None,
    }
}

/// PlugX sub-package for a parent package.
pub fn plugx_for(parent: &ParentPackage<'_>) -> Option<Package> {
    match parent {
        ParentPackage::Specialized(Package::PlugXPayload) => Some(Package::PlugXPayload),
        ParentPackage::Generic { base: Some(base), .. } => match base {
            BasePackage::Exe => Some(Package::PlugX),
            BasePackage::Dll => Some(Package::PlugXDll),
            BasePackage::Doc => Some(Package::PlugXDoc),
            BasePackage::Zip => Some(Package::PlugXZip),
            BasePackage::Js | BasePackage::Ps1 | BasePackage::Regsvr => None,
        },
        _ => None,
    }
}

/// Pick at most one follow-up package.
///
/// With behavioral signatures present, `Unpacker` hits add the matching
/// unpacker to `detections` (it runs as a fallback job) and `PlugX` hits pick
/// the PlugX sub-package. Without them, the first static family in
/// [`Family::PRIORITY`] that was detected decides.
pub fn select_package(
    detections: &mut DetectionSet,
    signatures: Option<&[Signature]>,
    parent: &ParentPackage<'_>,
) -> Option<Package> {
    match signatures.filter(|s| !s.is_empty()) {
        Some(signatures) => select_dynamic(detections, signatures, parent),
        None => select_static(detections, parent),
    }
}

fn select_dynamic(
    detections: &mut DetectionSet,
    signatures: &[Signature],
    parent: &ParentPackage<'_>,
) -> Option<Package> {
    if *parent == ParentPackage::Absent {
        return None;
    }

    let mut selected = None;

    for signature in signatures {
        match BehaviorSignature::from_name(&signature.name) {
            Some(BehaviorSignature::Unpacker) => {
                if let Some(unpacker) = parent.base().and_then(unpacker_for) {
                    debug!("Unpacker signature maps to {}", unpacker);
                    detections.insert(unpacker);
                }
            }
            Some(BehaviorSignature::PlugX) => {
                if let Some(package) = plugx_for(parent) {
                    debug!("PlugX signature maps to {}", package);
                    detections.insert(package);
                    selected = Some(package);
                }
            }
            None => {}
        }
    }

    selected
}

fn select_static(detections: &DetectionSet, parent: &ParentPackage<'_>) -> Option<Package> {
    let family = Family::PRIORITY
        .into_iter()
        .find(|family| detections.contains(family.label()))?;

    debug!("Static detection {:?} decides the package", family);
    family.package_for(parent)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signatures(names: &[&str]) -> Vec<Signature> {
        names
            .iter()
            .map(|name| Signature {
                name: name.to_string(),
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn test_package_names_round_trip() {
        for package in Package::ALL {
            assert_eq!(Package::from_name(package.name()), Some(package));
        }
        assert_eq!(Package::from_name("exe"), None);
    }

    #[test]
    fn test_parent_package_parse() {
        assert_eq!(ParentPackage::parse(None), ParentPackage::Absent);
        assert_eq!(ParentPackage::parse(Some("")), ParentPackage::Absent);
        assert_eq!(
            ParentPackage::parse(Some("Unpacker_dll")),
            ParentPackage::Specialized(Package::UnpackerDll)
        );
        assert_eq!(ParentPackage::parse(Some("pdf")).base(), None);
        assert!(ParentPackage::parse(Some("Unpacker_js")).is_unpacker());
        assert!(!ParentPackage::parse(Some("PlugX")).is_unpacker());
    }

    #[test]
    fn test_unpacker_signature_adds_fallback_label() {
        let mut detections = DetectionSet::default();
        let parent = ParentPackage::parse(Some("dll"));
        let selected = select_package(
            &mut detections,
            Some(&signatures(&["Unpacker", "Injection"])),
            &parent,
        );

        assert_eq!(selected, None);
        assert_eq!(detections.iter().collect::<Vec<_>>(), vec![Package::UnpackerDll]);
    }

    #[test]
    fn test_documents_are_not_unpacked() {
        let mut detections = DetectionSet::default();
        let parent = ParentPackage::parse(Some("doc"));
        select_package(&mut detections, Some(&signatures(&["Unpacker"])), &parent);
        assert!(detections.is_empty());
    }

    #[test]
    fn test_plugx_signature_selects_sub_package() {
        let mut detections = DetectionSet::default();
        let parent = ParentPackage::parse(Some("zip"));
        let selected = select_package(&mut detections, Some(&signatures(&["PlugX"])), &parent);
        assert_eq!(selected, Some(Package::PlugXZip));
        assert!(detections.contains(Package::PlugXZip));
    }

    #[test]
    fn test_static_priority_order() {
        let mut detections = DetectionSet::default();
        detections.insert(Package::RegBinary);
        detections.insert(Package::Hancitor);
        detections.insert(Package::TrickBot);

        let exe = ParentPackage::parse(Some("exe"));
        assert_eq!(select_package(&mut detections, None, &exe), Some(Package::TrickBot));

        // TrickBot still wins the decision for a dll, even without a dll package.
        let dll = ParentPackage::parse(Some("dll"));
        assert_eq!(select_package(&mut detections, None, &dll), None);
    }

    #[test]
    fn test_static_hancitor_and_regbinary() {
        let mut detections = DetectionSet::default();
        detections.insert(Package::Hancitor);
        let dll = ParentPackage::parse(Some("dll"));
        assert_eq!(select_package(&mut detections, None, &dll), Some(Package::HancitorDll));

        let mut detections = DetectionSet::default();
        detections.insert(Package::RegBinary);
        let anything = ParentPackage::parse(Some("js"));
        assert_eq!(
            select_package(&mut detections, Some(&[]), &anything),
            Some(Package::RegBinary)
        );
    }

    #[test]
    fn test_selection_is_deterministic() {
        let parent = ParentPackage::parse(Some("exe"));
        let run = || {
            let mut detections = DetectionSet::default();
            detections.insert(Package::Hancitor);
            let selected = select_package(
                &mut detections,
                Some(&signatures(&["Unpacker", "PlugX"])),
                &parent,
            );
            (selected, detections)
        };
        assert_eq!(run(), run());
    }
}
