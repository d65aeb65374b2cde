use newsrec::{
    BehaviorLog, Candidate, Config, Corpus, Evaluator, History, Impression, InMemoryBehaviorLog,
    InMemoryCorpus, ModelConfig, News, NewsRecModel, TrainingConfig, TrainingSession,
};

fn small_model_config() -> ModelConfig {
    ModelConfig {
        vocab_size: 64,
        word_embed_dim: 10,
        reduced_embed_dim: None,
        pad_token_id: 0,
        num_categories: 6,
        category_embed_dim: 8,
        category_pad_id: 0,
        use_sapo: true,
        use_category: true,
        num_cnn_filters: 12,
        window_size: 3,
        query_dim: 9,
        dropout: 0.2,
        max_title_length: 6,
        max_sapo_length: 10,
        his_length: 5,
    }
}

fn small_corpus(config: &ModelConfig) -> InMemoryCorpus {
    let mut corpus = InMemoryCorpus::new();
    for id in 1..=10u32 {
        let base = (id * 3) % (config.vocab_size as u32 - 8) + 1;
        let mut title = vec![0u32; config.max_title_length];
        for (i, slot) in title.iter_mut().enumerate().take(4) {
            *slot = base + i as u32;
        }
        let mut sapo = vec![0u32; config.max_sapo_length];
        for (i, slot) in sapo.iter_mut().enumerate().take(7) {
            *slot = base + 1 + i as u32;
        }
        corpus.insert(News::new(id, title, sapo, id % config.num_categories as u32));
    }
    corpus
}

#[test]
fn test_end_to_end_scenario() {
    // A user with two real clicks (A=1, B=2) and his_length 5, so the
    // history carries three padding slots. The impression offers one
    // clicked candidate (C=3) and two non-clicked (D=4, E=5).
    let model_config = small_model_config();
    let corpus = small_corpus(&model_config);
    let mut model = NewsRecModel::new(&model_config, 42).unwrap();

    let history = History::new(&[1, 2], model_config.his_length);
    assert_eq!(history.num_clicks(), 2);

    let impression = Impression::new(
        1,
        100,
        history,
        vec![
            Candidate::new(3, true),
            Candidate::new(4, false),
            Candidate::new(5, false),
        ],
    );

    // Training with npratio 2 consumes both negatives alongside the
    // click, giving a 3-way softmax per instance.
    let training_config = TrainingConfig {
        npratio: 2,
        gradient_accumulation_steps: 1,
        total_steps: 100,
        seed: 7,
        ..TrainingConfig::default()
    };
    let mut session = TrainingSession::new(training_config);
    let loss = session
        .train_impression(&mut model, &corpus, &impression)
        .unwrap()
        .unwrap();
    assert!(loss.is_finite() && loss > 0.0);
    assert_eq!(session.step(), 1);

    // Evaluation on the same impression: every metric lands in range.
    let evaluator = Evaluator::with_ndcg_ks(vec![5, 10]);
    let metrics = evaluator
        .evaluate_impression(&model, &corpus, &impression)
        .unwrap();
    let auc = metrics.auc.unwrap();
    assert!((0.0..=1.0).contains(&auc));
    let mrr = metrics.mrr.unwrap();
    assert!(mrr > 0.0 && mrr <= 1.0);
    for ndcg in &metrics.ndcg {
        let ndcg = ndcg.unwrap();
        assert!((0.0..=1.0).contains(&ndcg));
    }
}

#[test]
fn test_inference_is_deterministic_across_calls() {
    let model_config = small_model_config();
    let corpus = small_corpus(&model_config);
    let model = NewsRecModel::new(&model_config, 42).unwrap();

    let history = History::new(&[1, 2, 3], model_config.his_length);
    let (vectors_a, mask_a) = model.encode_history(&corpus, &history).unwrap();
    let (vectors_b, mask_b) = model.encode_history(&corpus, &history).unwrap();
    assert_eq!(mask_a, mask_b);
    assert_eq!(vectors_a, vectors_b);

    let user_a = model.encode_user(&vectors_a, &mask_a).unwrap();
    let user_b = model.encode_user(&vectors_b, &mask_b).unwrap();
    assert_eq!(user_a, user_b);
}

#[test]
fn test_identical_seeds_build_identical_models() {
    let model_config = small_model_config();
    let corpus = small_corpus(&model_config);
    let model_a = NewsRecModel::new(&model_config, 9).unwrap();
    let model_b = NewsRecModel::new(&model_config, 9).unwrap();

    let news = corpus.news(3).unwrap();
    assert_eq!(
        model_a.encode_news(news).unwrap(),
        model_b.encode_news(news).unwrap()
    );
}

#[test]
fn test_training_improves_ranking_on_log() {
    let model_config = ModelConfig {
        dropout: 0.0,
        ..small_model_config()
    };
    let corpus = small_corpus(&model_config);
    let mut model = NewsRecModel::new(&model_config, 42).unwrap();

    let mut log = InMemoryBehaviorLog::default();
    for i in 0..4u64 {
        log.push(Impression::new(
            i,
            100,
            History::new(&[1, 2], model_config.his_length),
            vec![
                Candidate::new(3, true),
                Candidate::new(4, false),
                Candidate::new(5, false),
                Candidate::new(6, false),
            ],
        ));
    }

    let training_config = TrainingConfig {
        learning_rate: 0.01,
        npratio: 2,
        gradient_accumulation_steps: 2,
        warmup_ratio: 0.0,
        total_steps: 500,
        weight_decay: 0.0,
        seed: 7,
        ..TrainingConfig::default()
    };
    let mut session = TrainingSession::new(training_config);

    let mut first_epoch_loss = 0.0;
    let mut last_epoch_loss = 0.0;
    for epoch in 0..25 {
        let mut epoch_loss = 0.0;
        for impression in log.impressions() {
            epoch_loss += session
                .train_impression(&mut model, &corpus, impression)
                .unwrap()
                .unwrap();
        }
        session.flush(&mut model);
        if epoch == 0 {
            first_epoch_loss = epoch_loss;
        }
        last_epoch_loss = epoch_loss;
    }
    assert!(
        last_epoch_loss < first_epoch_loss,
        "loss did not decrease: {first_epoch_loss} -> {last_epoch_loss}"
    );

    // After fitting, the clicked candidate should outrank the rest.
    let evaluator = Evaluator::with_ndcg_ks(vec![4]);
    let report = evaluator.evaluate(&model, &corpus, log.impressions()).unwrap();
    assert_eq!(report.num_impressions, 4);
    assert_eq!(report.num_skipped, 0);
    assert!(report.auc > 0.5, "auc after training: {}", report.auc);
}

#[test]
fn test_title_only_variant_end_to_end() {
    let model_config = ModelConfig {
        use_sapo: false,
        use_category: false,
        ..small_model_config()
    };
    let corpus = small_corpus(&model_config);
    let mut model = NewsRecModel::new(&model_config, 42).unwrap();

    let impression = Impression::new(
        1,
        100,
        History::new(&[1, 2], model_config.his_length),
        vec![
            Candidate::new(3, true),
            Candidate::new(4, false),
            Candidate::new(5, false),
        ],
    );

    let training_config = TrainingConfig {
        npratio: 2,
        gradient_accumulation_steps: 1,
        total_steps: 100,
        ..TrainingConfig::default()
    };
    let mut session = TrainingSession::new(training_config);
    let loss = session
        .train_impression(&mut model, &corpus, &impression)
        .unwrap()
        .unwrap();
    assert!(loss.is_finite());

    let evaluator = Evaluator::new(&Config::default().evaluation);
    let metrics = evaluator
        .evaluate_impression(&model, &corpus, &impression)
        .unwrap();
    assert!(metrics.auc.is_some());
}
