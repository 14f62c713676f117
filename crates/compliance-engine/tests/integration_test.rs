//! 合规引擎集成测试
//!
//! 覆盖规则集加载、条件求值、动作执行到报告汇总的完整流程。

use compliance_engine::{
    BuildingModel, BuildingObject, CachePolicy, ComplianceEngine, ComplianceReport, EngineConfig,
    Location, OptimizationLevel, OptimizerConfig, RuleStore, Severity,
};
use serde_json::json;
use std::path::PathBuf;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn office_model() -> BuildingModel {
    let content = std::fs::read_to_string(fixture("office_model.json")).unwrap();
    serde_json::from_str(&content).unwrap()
}

fn engine_with(level: OptimizationLevel) -> ComplianceEngine {
    ComplianceEngine::new(EngineConfig {
        optimizer: OptimizerConfig {
            level,
            max_workers: 4,
            cache: CachePolicy::Lru { capacity: 64 },
        },
        ..EngineConfig::default()
    })
    .unwrap()
}

fn inline_rule_set(rules: serde_json::Value) -> String {
    json!({
        "id": "inline",
        "name": "Inline rules",
        "jurisdiction": {"country": "US"},
        "rules": rules
    })
    .to_string()
}

/// 报告中的计数必须等于各规则结果之和
fn assert_counts_consistent(report: &ComplianceReport) {
    let results = report.rule_set_reports.iter().flat_map(|r| &r.results);
    let violations: usize = results.clone().map(|r| r.violations.len()).sum();
    let warnings: usize = results.clone().map(|r| r.warnings.len()).sum();
    let passed = results.clone().filter(|r| r.passed).count();

    assert_eq!(report.total_violations, violations);
    assert_eq!(report.total_warnings, warnings);
    assert_eq!(report.passed_rules, passed);
    for rs in &report.rule_set_reports {
        assert_eq!(rs.total_rules, rs.results.len());
        assert_eq!(rs.passed_rules + rs.failed_rules, rs.total_rules);
    }
    for result in results {
        let has_error = result.violations.iter().any(|v| v.severity == Severity::Error);
        assert_eq!(result.passed, !has_error);
    }
}

#[test]
fn test_single_narrow_door_violation() {
    let engine = engine_with(OptimizationLevel::Advanced);
    let rules = engine
        .store()
        .load_from_str(
            "doors",
            &inline_rule_set(json!([{
                "rule_id": "door_width",
                "name": "Door width",
                "conditions": [{"type": "property", "element_type": "door",
                                "property": "width", "operator": "<", "value": 0.8}],
                "actions": [{"type": "validation", "severity": "error",
                             "message": "Door {element_id} below 0.8m"}]
            }])),
        )
        .unwrap();
    let model = BuildingModel::new(
        "b1",
        "Single door",
        vec![BuildingObject::new("door_7", "door").with_property("width", 0.7)],
    );

    let report = engine.validate_rule_sets(&model, &[rules]).unwrap();

    assert_eq!(report.total_violations, 1);
    let violation = &report.rule_set_reports[0].results[0].violations[0];
    assert_eq!(violation.element_id.as_deref(), Some("door_7"));
    assert_eq!(violation.element_type.as_deref(), Some("door"));
    assert_eq!(violation.message, "Door door_7 below 0.8m");
    assert_eq!(report.overall_compliance_score, 0.0);
}

#[test]
fn test_composite_or_matches_two_objects() {
    let engine = engine_with(OptimizationLevel::None);
    let rules = engine
        .store()
        .load_from_str(
            "or",
            &inline_rule_set(json!([{
                "rule_id": "large_or_storage",
                "name": "Large or storage",
                "conditions": [{"type": "composite", "composite_operator": "OR", "conditions": [
                    {"type": "spatial", "property": "area", "operator": ">", "value": 50},
                    {"type": "property", "property": "type", "operator": "==", "value": "storage"}
                ]}],
                "actions": [{"type": "warning", "message": "{element_id}"}]
            }])),
        )
        .unwrap();
    let model = BuildingModel::new(
        "b1",
        "Three spaces",
        vec![
            BuildingObject::new("a", "room").with_property("area", 10),
            BuildingObject::new("b", "room").with_property("area", 60),
            BuildingObject::new("c", "storage").with_property("area", 20),
        ],
    );

    let report = engine.validate_rule_sets(&model, &[rules]).unwrap();
    let warned: Vec<&str> = report.rule_set_reports[0].results[0]
        .warnings
        .iter()
        .map(|w| w.message.as_str())
        .collect();
    assert_eq!(warned, vec!["b", "c"]);
}

#[test]
fn test_calculation_over_two_rooms() {
    let engine = engine_with(OptimizationLevel::Basic);
    let rules = engine
        .store()
        .load_from_str(
            "calc",
            &inline_rule_set(json!([{
                "rule_id": "half_area",
                "name": "Half of room area",
                "conditions": [{"type": "property", "element_type": "room",
                                "property": "type", "operator": "==", "value": "room"}],
                "actions": [{"type": "calculation", "name": "half", "formula": "total_area(room) / 2"}]
            }])),
        )
        .unwrap();
    let model = BuildingModel::new(
        "b1",
        "Two rooms",
        vec![
            BuildingObject::new("r1", "room")
                .with_location(Location::new(0.0, 0.0, 0.0).with_size(8.0, 5.0, 3.0)),
            BuildingObject::new("r2", "room")
                .with_location(Location::new(8.0, 0.0, 0.0).with_size(10.0, 6.0, 3.0)),
        ],
    );

    let report = engine.validate_rule_sets(&model, &[rules]).unwrap();
    let calc = &report.rule_set_reports[0].results[0].calculations["half"];
    assert_eq!(calc.value, 50.0);
    assert!(report.rule_set_reports[0].results[0].passed);
}

#[test]
fn test_missing_jurisdiction_is_reported_and_skipped() {
    let store = RuleStore::new();
    let defects = store.validate(fixture("missing_jurisdiction.json"));
    assert!(defects.contains(&"Missing jurisdiction country".to_string()));

    let engine = engine_with(OptimizationLevel::Advanced);
    let report = engine
        .validate_building_model(
            &office_model(),
            &[fixture("fire_safety.json"), fixture("missing_jurisdiction.json")],
        )
        .unwrap();

    assert_eq!(report.rule_set_reports.len(), 1);
    assert_eq!(report.skipped_rule_sets.len(), 1);
    assert_eq!(report.skipped_rule_sets[0].code, "MALFORMED_RULE_SET");
    assert!(report.skipped_rule_sets[0].reason.contains("Missing jurisdiction country"));
    assert_counts_consistent(&report);
}

#[test]
fn test_full_office_run() {
    let engine = engine_with(OptimizationLevel::Advanced);
    let report = engine
        .validate_building_model(&office_model(), &[fixture("fire_safety.json")])
        .unwrap();

    assert_eq!(report.building_id, "bldg-042");
    assert_eq!(report.building_name, "Harbor Office");
    assert!(!report.cancelled);
    assert!(report.skipped_rule_sets.is_empty());

    let rs = &report.rule_set_reports[0];
    assert_eq!(rs.rule_set_id, "us-ca-office");
    assert_eq!(rs.jurisdiction.to_string(), "US/CA");

    // 禁用的规则不计入，结果按声明顺序排列
    let ids: Vec<&str> = rs.results.iter().map(|r| r.rule_id.as_str()).collect();
    assert_eq!(
        ids,
        vec![
            "door_min_width",
            "large_or_storage",
            "floor_area_summary",
            "acoustic_separation",
            "circuit_load"
        ]
    );

    assert_eq!(report.total_rules, 5);
    assert_eq!(report.passed_rules, 2);
    assert!((report.overall_compliance_score - 0.4).abs() < 1e-9);
    assert_eq!(report.total_violations, 4);
    assert_eq!(report.total_warnings, 2);
    assert_eq!(report.critical_violations, 4);
    assert_counts_consistent(&report);

    let door = &rs.results[0];
    assert_eq!(
        door.violations[0].message,
        "Door door_1 is 0.7m wide, minimum is 0.8m"
    );
    assert_eq!(door.violations[0].code_reference.as_deref(), Some("CBC 11B-404.2.3"));
    assert!(door.violations[0].location.is_some());

    let summary = &rs.results[2];
    assert_eq!(summary.calculations["half_room_area"].value, 50.0);
    assert!((summary.calculations["egress_capacity"].value - 30.0).abs() < 1e-9);

    let acoustic = &rs.results[3];
    assert!(!acoustic.passed);
    assert!(acoustic.error.as_deref().is_some_and(|e| e.contains("acoustic")));

    let circuit = &rs.results[4];
    let outlets: Vec<&str> = circuit
        .violations
        .iter()
        .filter_map(|v| v.element_id.as_deref())
        .collect();
    assert_eq!(outlets, vec!["outlet_1", "outlet_2"]);
    assert_eq!(
        circuit.violations[0].message,
        "Outlet outlet_1 is on overloaded circuit A"
    );

    assert_eq!(report.violations_by_category["electrical"], 2);
    assert_eq!(report.violations_by_category["accessibility"], 1);
    assert_eq!(report.violations_by_category["acoustics"], 1);
    assert!(!report.violations_by_category.contains_key("fire_safety"));
    assert_eq!(report.warnings_by_category["fire_safety"], 2);
    assert_eq!(
        report.recommendations[0],
        "Address 2 electrical violations to improve compliance."
    );
}

#[test]
fn test_unknown_operator_fails_only_its_rule() {
    let engine = engine_with(OptimizationLevel::Advanced);
    let report = engine
        .validate_building_model(&office_model(), &[fixture("unknown_operator.json")])
        .unwrap();

    let rs = &report.rule_set_reports[0];
    assert_eq!(rs.rule_set_id, "us-egress");
    assert_eq!(rs.total_rules, 2);
    assert!(!rs.results[0].passed);
    assert!(
        rs.results[0].violations[0]
            .message
            .starts_with("Rule evaluation failed")
    );
    assert!(rs.results[1].passed);
    assert_eq!(report.overall_compliance_score, 0.5);
}

#[test]
fn test_repeat_runs_are_identical() {
    let engine = engine_with(OptimizationLevel::Advanced);
    let paths = [fixture("fire_safety.json"), fixture("unknown_operator.json")];
    let model = office_model();

    let first = engine.validate_building_model(&model, &paths).unwrap();
    let second = engine.validate_building_model(&model, &paths).unwrap();

    let a = serde_json::to_vec(&first.without_timing()).unwrap();
    let b = serde_json::to_vec(&second.without_timing()).unwrap();
    assert_eq!(a, b);
    assert!(engine.stats().optimizer.cache_hits > 0);
}

#[test]
fn test_parallel_matches_sequential() {
    let paths = [fixture("fire_safety.json"), fixture("unknown_operator.json")];
    let model = office_model();

    let sequential = engine_with(OptimizationLevel::None)
        .validate_building_model(&model, &paths)
        .unwrap();
    let parallel = engine_with(OptimizationLevel::Advanced)
        .validate_building_model(&model, &paths)
        .unwrap();

    assert_eq!(sequential.without_timing(), parallel.without_timing());
}

#[test]
fn test_invalid_model_is_the_only_fatal_error() {
    let engine = engine_with(OptimizationLevel::Advanced);
    let model = BuildingModel::new(
        "b1",
        "Duplicated",
        vec![BuildingObject::new("x", "door"), BuildingObject::new("x", "door")],
    );

    let err = engine
        .validate_building_model(&model, &[fixture("fire_safety.json")])
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_MODEL");
}

#[test]
fn test_huge_nearby_radius_still_reports() {
    let engine = engine_with(OptimizationLevel::Advanced);
    let rules = engine
        .store()
        .load_from_str(
            "nearby",
            &inline_rule_set(json!([{
                "rule_id": "rooms_near_exit",
                "name": "Rooms near an exit",
                "conditions": [{"type": "spatial", "element_type": "room", "property": "nearby",
                                "value": 1e20, "target_type": "exit"}],
                "actions": [{"type": "warning", "message": "{element_id} has an exit in range"}]
            }])),
        )
        .unwrap();

    let report = engine.validate_rule_sets(&office_model(), &[rules]).unwrap();
    let result = &report.rule_set_reports[0].results[0];
    assert!(result.passed);
    assert!(result.error.is_none());
    assert!(!result.warnings.is_empty());
}
