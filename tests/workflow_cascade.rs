use cytoflow::{
    config::AnalysisParameters,
    experiment::{Column, ConditionKind, ConditionValue},
    operations::{
        AutofluorescenceOp, ColorTranslationOp, ImportOp, ImportTube, KMeansOp, Operation,
        ThresholdOp,
    },
    protocol::ItemStatus,
    workflow::{Workflow, WorkflowEvent},
};
use std::{cell::RefCell, collections::BTreeMap, fs, path::PathBuf, rc::Rc};

fn write_csv(dir: &tempfile::TempDir, name: &str, header: &str, rows: &[[f64; 2]]) -> PathBuf {
    let mut text = format!("{header}\n");
    for row in rows {
        text.push_str(&format!("{},{}\n", row[0], row[1]));
    }
    let path = dir.path().join(name);
    fs::write(&path, text).unwrap();
    path
}

fn import(tube: PathBuf) -> Operation {
    let mut conditions = BTreeMap::new();
    conditions.insert("Dox".to_string(), ConditionValue::Float(1.0));
    let mut op = ImportOp {
        tubes: vec![ImportTube {
            file: tube,
            conditions,
        }],
        ..Default::default()
    };
    op.conditions.insert("Dox".to_string(), ConditionKind::Float);
    Operation::Import(op)
}

#[test]
fn test_updating_head_leaves_downstream_invalid_until_updated() {
    let dir = tempfile::tempdir().unwrap();
    let tube = write_csv(
        &dir,
        "tube.csv",
        "FITC-A,PE-A",
        &[[1.0, 10.0], [2.0, 20.0], [30.0, 300.0], [40.0, 400.0]],
    );
    let mut wf = Workflow::default();
    wf.push(import(tube));
    wf.push(Operation::Threshold(ThresholdOp {
        name: "Bright".to_string(),
        channel: "FITC-A".to_string(),
        threshold: 10.0,
    }));
    wf.push(Operation::KMeans(KMeansOp {
        name: "Cluster".to_string(),
        xchannel: "FITC-A".to_string(),
        ychannel: "PE-A".to_string(),
        initial_centroids: vec![vec![0.0, 0.0], vec![50.0, 500.0]],
    }));
    assert!(wf.summary().is_fully_valid());

    let invalidated = Rc::new(RefCell::new(vec![]));
    let sink = invalidated.clone();
    wf.subscribe(move |event| {
        if let WorkflowEvent::StatusChanged {
            index,
            status: ItemStatus::Invalid,
        } = event
        {
            sink.borrow_mut().push(*index);
        }
    });

    wf.update(0).unwrap();
    assert_eq!(wf.item(0).unwrap().status(), ItemStatus::Valid);
    for index in [1, 2] {
        let item = wf.item(index).unwrap();
        assert_eq!(item.status(), ItemStatus::Invalid);
        assert!(item.result().is_none());
    }
    assert_eq!(*invalidated.borrow(), vec![1, 2]);

    wf.update_from(1);
    let result = wf.item(2).unwrap().result().unwrap();
    assert_eq!(result.column("Cluster"), Some(&Column::Int(vec![0, 0, 1, 1])));
    assert_eq!(result.history().len(), 3);
    assert_eq!(
        wf.item(2).unwrap().conditions(),
        vec!["Dox".to_string(), "Bright".to_string(), "Cluster".to_string()]
    );
}

#[test]
fn test_autofluorescence_then_color_translation() {
    let dir = tempfile::tempdir().unwrap();
    let tube = write_csv(&dir, "tube.csv", "FITC-A,PE-A", &[[110.0, 25.0], [1010.0, 115.0]]);
    let blank = write_csv(
        &dir,
        "blank.csv",
        "FITC-A,PE-A",
        &[[9.0, 4.0], [10.0, 5.0], [11.0, 6.0]],
    );
    // after subtracting the blank: PE = 0.1 * FITC
    let control_rows: Vec<[f64; 2]> = (1..=50)
        .map(|i| {
            let fitc = i as f64 * 20.0;
            [fitc + 10.0, 0.1 * fitc + 5.0]
        })
        .collect();
    let control = write_csv(&dir, "control.csv", "FITC-A,PE-A", &control_rows);

    let mut wf = Workflow::default();
    wf.push(import(tube));
    wf.push(Operation::Autofluorescence(AutofluorescenceOp {
        name: "AF".to_string(),
        channels: vec!["FITC-A".to_string(), "PE-A".to_string()],
        blank_file: Some(blank),
        ..Default::default()
    }));
    let mut translate = ColorTranslationOp {
        name: "Translate".to_string(),
        ..Default::default()
    };
    translate
        .translation
        .insert("FITC-A".to_string(), "PE-A".to_string());
    translate
        .controls
        .insert(("FITC-A".to_string(), "PE-A".to_string()), control);
    wf.push(Operation::ColorTranslation(translate));

    for index in 0..3 {
        let item = wf.item(index).unwrap();
        assert_eq!(item.status(), ItemStatus::Valid, "{:?}", item.error());
    }
    let corrected = wf.item(1).unwrap().result().unwrap();
    assert_eq!(corrected.channel_values("FITC-A").unwrap(), &[100.0, 1000.0]);
    let baseline = corrected.metadata("PE-A").unwrap().baseline.unwrap();
    assert_eq!(baseline.median, 5.0);

    let translated = wf.item(2).unwrap().result().unwrap().clone();
    let values = translated.channel_values("FITC-A").unwrap();
    assert!((values[0] - 10.0).abs() < 1e-6, "{values:?}");
    assert!((values[1] - 100.0).abs() < 1e-6, "{values:?}");
    let meta = translated.metadata("FITC-A").unwrap();
    assert_eq!(meta.translation.as_ref().unwrap().target, "PE-A");

    // a history snapshot is unaffected by reconfiguring the live operation
    let before = translated.history()[1].clone();
    wf.configure(1, |op| {
        if let Operation::Autofluorescence(af) = op {
            af.channels = vec!["FITC-A".to_string()];
        }
    })
    .unwrap();
    assert_eq!(translated.history()[1], before);
    assert_eq!(wf.item(2).unwrap().status(), ItemStatus::Valid);
}

#[test]
fn test_unreliable_mixture_fit_is_a_warning_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let tube = write_csv(&dir, "tube.csv", "FITC-A,PE-A", &[[100.0, 10.0], [1000.0, 100.0]]);
    let control_rows: Vec<[f64; 2]> = (1..=40)
        .map(|i| {
            let fitc = i as f64 * 25.0;
            [fitc, 0.1 * fitc]
        })
        .collect();
    let control = write_csv(&dir, "control.csv", "FITC-A,PE-A", &control_rows);

    let params = AnalysisParameters {
        mixture_max_iterations: 1,
        ..Default::default()
    };
    let mut wf = Workflow::new(params);
    wf.push(import(tube));
    let mut translate = ColorTranslationOp {
        name: "Translate".to_string(),
        mixture_model: true,
        ..Default::default()
    };
    translate
        .translation
        .insert("FITC-A".to_string(), "PE-A".to_string());
    translate
        .controls
        .insert(("FITC-A".to_string(), "PE-A".to_string()), control);
    wf.push(Operation::ColorTranslation(translate));

    let item = wf.item(1).unwrap();
    assert_eq!(item.status(), ItemStatus::Valid, "{:?}", item.error());
    assert!(item.error().is_none());
    assert!(item.warning().unwrap().contains("did not converge"));
    assert!(item.result().is_some());
    let summary = wf.summary();
    assert!(summary.is_fully_valid());
    assert!(summary.items[1].warning.is_some());
}
