use training::metrics::{ConfusionMatrix, EvaluationMetrics, LossWindow};

#[test]
fn weighted_and_macro_f1_follow_support() {
    let mut matrix = ConfusionMatrix::new(3);
    // truth 0: 3 correct, 1 predicted as 1
    matrix.record_batch(&[0, 0, 0, 0], &[0, 0, 0, 1]);
    // truth 1: 1 correct
    matrix.record_batch(&[1], &[1]);
    // truth 2: never predicted correctly
    matrix.record_batch(&[2], &[0]);

    let c0 = matrix.class_stats(0);
    assert!((c0.precision - 0.75).abs() < 1e-12);
    assert!((c0.recall - 0.75).abs() < 1e-12);
    let c1 = matrix.class_stats(1);
    assert!((c1.f1 - 2.0 / 3.0).abs() < 1e-12);
    assert_eq!(matrix.class_stats(2).f1, 0.0);

    let weighted = (0.75 * 4.0 + (2.0 / 3.0) * 1.0) / 6.0;
    assert!((matrix.weighted_f1() - weighted).abs() < 1e-12);
    let macro_f1 = (0.75 + 2.0 / 3.0 + 0.0) / 3.0;
    assert!((matrix.macro_f1() - macro_f1).abs() < 1e-12);
    assert!((matrix.accuracy() - 4.0 / 6.0).abs() < 1e-12);
}

#[test]
fn evaluation_loss_is_sample_weighted() {
    let mut metrics = EvaluationMetrics::new(2);
    metrics.update(1.0, &[0, 0, 0], &[0, 0, 0]);
    metrics.update(4.0, &[1], &[0]);
    let summary = metrics.finalize().expect("summary");
    assert!((summary.average_loss - 7.0 / 4.0).abs() < 1e-12);
    assert_eq!(summary.samples, 4);
    assert_eq!(summary.per_class.len(), 2);

    assert!(EvaluationMetrics::new(2).finalize().is_none());
}

#[test]
fn loss_window_reports_mean_since_last_log() {
    let mut window = LossWindow::default();
    assert_eq!(window.take_mean(), None);
    window.push(1.0);
    window.push(3.0);
    assert_eq!(window.take_mean(), Some(2.0));
    window.push(5.0);
    assert_eq!(window.take_mean(), Some(5.0));
    assert_eq!(window.epoch_mean(), Some(3.0));
}
