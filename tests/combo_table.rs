mod common;

use common::Fixture;
use mecombo::combo::BuildError;

#[test]
fn table_holds_exemplar_block_then_candidates() {
    let fixture = Fixture::new();
    let table = fixture.build(false).unwrap();
    let rows = table.rows();

    assert_eq!(rows.len(), 12);
    assert_eq!(table.exemplar_count(), 8);
    for (idx, row) in rows.iter().enumerate() {
        assert_eq!(row.uid, idx as i64);
        assert!(row.to_run);
        assert!(row.scores.is_none() && row.exception.is_none());
    }
    assert!(rows[..8].iter().all(|r| r.is_exemplar));
    assert!(rows[8..].iter().all(|r| !r.is_exemplar && r.is_repaired && !r.is_original));

    // four exemplar rows per e-model: {original, gating} x {unrepaired, repaired}
    let emodel1: Vec<_> = rows[..4]
        .iter()
        .map(|r| (r.emodel.as_str(), r.is_repaired, r.is_original))
        .collect();
    assert_eq!(
        emodel1,
        vec![
            ("opt_emodel1", false, true),
            ("emodel1", false, false),
            ("opt_emodel1", true, true),
            ("emodel1", true, false),
        ]
    );
    for row in &rows[..8] {
        assert_eq!(row.opt_scores.is_some(), !row.is_repaired);
        assert_eq!(row.morph_name, "morph1");
        assert_eq!(row.layer.as_deref(), Some("1"));
    }
    assert_eq!(rows[0].morph_path(), fixture.path("unrepaired/morph1.asc"));
    assert_eq!(rows[2].morph_path(), fixture.path("repaired/morph1.asc"));

    let candidates: Vec<_> = rows[8..]
        .iter()
        .map(|r| (r.morph_name.as_str(), r.etype.as_deref().unwrap(), r.emodel.as_str()))
        .collect();
    assert_eq!(
        candidates,
        vec![
            ("morph1", "e1", "emodel1"),
            ("morph1", "e2", "emodel2"),
            ("morph2", "e1", "emodel1"),
            ("morph2", "e2", "emodel2"),
        ]
    );
    assert!(rows[8..].iter().all(|r| r.original_emodel.starts_with("opt_")));
}

#[test]
fn skipping_repaired_exemplar_emits_two_rows_per_emodel() {
    let fixture = Fixture::new();
    // the exemplar morphology need not be released in skip mode
    std::fs::remove_file(fixture.path("repaired/morph1.asc")).unwrap();
    fixture.write("neuronDB.dat", "morph2 1 L1_A\n");

    let table = fixture.build(true).unwrap();
    assert_eq!(table.exemplar_count(), 4);
    for row in table.rows().iter().filter(|r| r.is_exemplar) {
        assert!(!row.is_repaired);
        assert!(row.layer.is_none() && row.fullmtype.is_none());
        assert!(row.opt_scores.is_some());
    }
    assert_eq!(table.len(), 6);
}

#[test]
fn morphology_without_recipe_entry_is_fatal() {
    let fixture = Fixture::new();
    fixture.write("neuronDB.dat", "morph1 1 L1_A\nmorph2 1 L1_A\nmorph3 2 L2_B\n");

    let err = fixture.build(false).unwrap_err();
    match &err {
        BuildError::UnmatchedMorphologies(unmatched) => {
            assert_eq!(
                unmatched,
                &vec![("2".to_string(), "L2_B".to_string(), "morph3".to_string())]
            );
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("morph3"));
}

#[test]
fn combination_without_emodel_is_fatal() {
    let fixture = Fixture::new();
    fixture.write(
        "emodel_etype_map.json",
        r#"{"opt_emodel1": {"mm_recipe": "emodel1", "etype": "e1", "layer": ["1"]}}"#,
    );
    let err = fixture.build(false).unwrap_err();
    assert!(matches!(err, BuildError::UnmatchedEModels(ref u) if u.iter().all(|(_, e, _)| e == "e2")));
}

#[test]
fn morph_name_pattern_drops_non_matching_rows() {
    let fixture = Fixture::new();
    fixture.write(
        "emodel_etype_map.json",
        r#"{
          "opt_emodel1": {"mm_recipe": "emodel1", "etype": "e1", "morph_name": "morph1", "layer": ["1"]},
          "opt_emodel2": {"mm_recipe": "emodel2", "etype": "e2", "layer": ["1"]}
        }"#,
    );
    let table = fixture.build(false).unwrap();
    let emodel1: Vec<_> = table
        .rows()
        .iter()
        .filter(|r| !r.is_exemplar && r.emodel == "emodel1")
        .map(|r| r.morph_name.as_str())
        .collect();
    assert_eq!(emodel1, vec!["morph1"]);
    assert_eq!(table.len(), 11);
}

#[test]
fn morph_name_pattern_is_only_anchored_at_start() {
    // "morph1" also accepts "morph10": patterns match a prefix, not the whole name.
    let fixture = Fixture::new();
    fixture.write("neuronDB.dat", "morph1 1 L1_A\nmorph2 1 L1_A\nmorph10 1 L1_A\n");
    fixture.write("repaired/morph10.swc", "");
    fixture.write(
        "emodel_etype_map.json",
        r#"{"opt_emodel1": {"mm_recipe": "emodel1", "etype": "e1", "morph_name": "morph1", "layer": ["1"]},
            "opt_emodel2": {"mm_recipe": "emodel2", "etype": "e2", "morph_name": "morph1$", "layer": ["1"]}}"#,
    );
    let table = fixture.build(false).unwrap();
    let names = |emodel: &str| -> Vec<(String, String)> {
        table
            .rows()
            .iter()
            .filter(|r| !r.is_exemplar && r.emodel == emodel)
            .map(|r| (r.morph_name.clone(), r.morph_ext.clone()))
            .collect()
    };
    assert_eq!(
        names("emodel1"),
        vec![
            ("morph1".to_string(), ".asc".to_string()),
            ("morph10".to_string(), ".swc".to_string())
        ]
    );
    assert_eq!(names("emodel2"), vec![("morph1".to_string(), ".asc".to_string())]);
}

#[test]
fn missing_morphology_file_is_fatal() {
    let fixture = Fixture::new();
    std::fs::remove_file(fixture.path("repaired/morph2.asc")).unwrap();
    let err = fixture.build(false).unwrap_err();
    assert!(
        matches!(err, BuildError::MissingMorphologyFile { ref morph_name, .. } if morph_name == "morph2")
    );
}
