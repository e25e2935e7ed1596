use std::collections::{BTreeMap, BTreeSet, HashMap};

use proptest::prelude::*;
use rensemble_core::npy::write_npy;
use rensemble_core::{
    DiskBudget, EnsembleSelection, FitOutcome, MeanSquaredError, ModelKey, NBest, PredictionArray,
    PredictionCache, PredictionRecord, PredictionStore, SelectorConfig, Split, Unbounded,
    select_candidates,
};

const RMSE: MeanSquaredError = MeanSquaredError { squared: false };

fn keys(n: usize) -> Vec<ModelKey> {
    (0..n).map(|i| ModelKey::new(0, i as u64 + 2, 0.0).unwrap()).collect()
}

/// (候補数, 長さ) の予測行列と正解
fn arb_problem() -> impl Strategy<Value = (Vec<Vec<f64>>, Vec<f64>)> {
    (1usize..6, 1usize..12).prop_flat_map(|(m, n)| {
        (
            prop::collection::vec(prop::collection::vec(-10.0f64..10.0, n), m),
            prop::collection::vec(-10.0f64..10.0, n),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 12, .. ProptestConfig::default() })]

    #[test]
    fn prop_weights_sum_to_one((preds, labels) in arb_problem(), size in 1usize..15, seed in any::<u64>()) {
        let preds: Vec<PredictionArray> = preds.into_iter().map(PredictionArray::from_vec).collect();
        let refs: Vec<&PredictionArray> = preds.iter().collect();
        let labels = PredictionArray::from_vec(labels);
        let ks = keys(refs.len());
        let result = EnsembleSelection::new(size, &RMSE)
            .with_random_state(seed)
            .fit(&ks, &refs, &labels)
            .unwrap();

        let total: f64 = result.weights.iter().map(|w| w.1).sum();
        prop_assert!((total - 1.0).abs() < 1e-9);
        prop_assert!(result.weights.iter().all(|w| w.1 >= 0.0));
        prop_assert_eq!(result.member_order.len(), size);
        prop_assert_eq!(result.trajectory.len(), size);
    }

    #[test]
    fn prop_first_step_not_worse_than_worst_model((preds, labels) in arb_problem()) {
        let preds: Vec<PredictionArray> = preds.into_iter().map(PredictionArray::from_vec).collect();
        let refs: Vec<&PredictionArray> = preds.iter().collect();
        let labels = PredictionArray::from_vec(labels);
        let ks = keys(refs.len());
        let result = EnsembleSelection::new(3, &RMSE).fit(&ks, &refs, &labels).unwrap();

        let worst = refs
            .iter()
            .map(|p| rensemble_core::Loss::loss(&RMSE, labels.view(), p.view()))
            .fold(f64::NEG_INFINITY, f64::max);
        prop_assert!(result.trajectory[0].loss <= worst);
        // 2手目は1手目のモデルを重ねるだけでも同じ損失になるので悪化しない
        if result.trajectory.len() > 1 {
            prop_assert!(result.trajectory[1].loss <= result.trajectory[0].loss + 1e-12);
        }
    }

    #[test]
    fn prop_refit_is_idempotent((preds, labels) in arb_problem(), size in 1usize..10) {
        let preds: Vec<PredictionArray> = preds.into_iter().map(PredictionArray::from_vec).collect();
        let refs: Vec<&PredictionArray> = preds.iter().collect();
        let labels = PredictionArray::from_vec(labels);
        let ks = keys(refs.len());
        let sel = EnsembleSelection::new(size, &RMSE);
        let a = sel.fit(&ks, &refs, &labels).unwrap();
        let b = sel.fit(&ks, &refs, &labels).unwrap();
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(sel.fit_incremental(Some(&a), &ks, &refs, &labels).unwrap(), FitOutcome::Unchanged);
    }

    #[test]
    fn prop_single_candidate_is_stable(values in prop::collection::vec(-5.0f64..5.0, 1..8), size in 1usize..20) {
        let labels = PredictionArray::filled(vec![values.len()], 0.0);
        let pred = PredictionArray::from_vec(values);
        let ks = keys(1);
        let result = EnsembleSelection::new(size, &RMSE).fit(&ks, &[&pred], &labels).unwrap();
        prop_assert_eq!(result.member_order, vec![ks[0]; size]);
        prop_assert_eq!(result.weights, vec![(ks[0], 1.0)]);
    }

    #[test]
    fn prop_disk_budget_respected(
        models in prop::collection::vec((0.05f64..20.0, 1u8..4), 2..24),
        budget in 1.0f64..120.0,
    ) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = PredictionStore::new(dir.path());
        let mut records = BTreeMap::new();
        // run_id 1 が最悪のベースライン。他は 1..4 の損失から選ぶので同点が多い
        for (i, (cost, level)) in models.iter().enumerate() {
            let k = ModelKey::new(1, i as u64 + 1, 0.0).unwrap();
            let loss = if i == 0 { 1000.0 } else { f64::from(*level) };
            let path = store.run_dir(&k).join(store.naming().file_name(&k, Split::Ensemble));
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            write_npy(&path, &PredictionArray::from_vec(vec![loss])).unwrap();
            records.insert(k, PredictionRecord { loss, disk_cost_mb: Some(*cost), ..Default::default() });
        }
        let mut cache = PredictionCache::from_parts(records, HashMap::new(), BTreeSet::new());
        let config = SelectorConfig {
            nbest: NBest::Count(100),
            disk_budget: DiskBudget::Megabytes(budget),
            ..Default::default()
        };
        let set = select_candidates(&mut cache, &store, &config, &Unbounded).unwrap();

        let max_cost = models.iter().map(|m| m.0).fold(f64::NEG_INFINITY, f64::max);
        let used: f64 = set.keys.iter().map(|k| cache.record(k).unwrap().disk_cost_mb.unwrap()).sum();
        prop_assert!(used <= budget + max_cost + 1e-9, "used {} budget {} max {}", used, budget, max_cost);
        prop_assert!(!set.keys.is_empty());
    }
}
