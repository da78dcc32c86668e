use nanolm::{
    ByteTokenizer, CheckpointStore, DataLoader, FileCheckpointStore, ModelConfig, TokenWindows,
    Tokenizer, TrainConfig, Trainer, Transformer,
};

fn model_config() -> ModelConfig {
    ModelConfig::new(8, 2, 2, ByteTokenizer::VOCAB_SIZE, 16)
}

fn train_config(max_steps: usize) -> TrainConfig {
    TrainConfig {
        batch_size: 4,
        max_steps,
        peak_lr: 1e-2,
        min_lr: 1e-3,
        warmup_steps: 5,
        decay_steps: max_steps,
        log_interval: 10,
        eval_interval: 0,
        checkpoint_interval: 0,
        ..TrainConfig::default()
    }
}

fn repeating_text() -> Vec<usize> {
    ByteTokenizer.encode(&"the cat sat on the mat. ".repeat(40))
}

#[test]
fn fifty_steps_on_repeating_data_lower_the_loss() {
    let conf = train_config(50);
    let loader = DataLoader::new(TokenWindows::new(repeating_text(), 16).unwrap(), conf.batch_size)
        .shuffle(conf.seed)
        .drop_last(true);
    let mut trainer = Trainer::new(Transformer::new(model_config(), 7).unwrap(), conf).unwrap();

    let mut batches = loader.cycle();
    let mut losses = Vec::new();
    for _ in 0..50 {
        let batch = batches.next().unwrap();
        let stats = trainer.train_step(std::slice::from_ref(&batch)).unwrap();
        assert!(!stats.skipped);
        assert_eq!(stats.tokens, 4 * 16);
        losses.push(stats.loss);
    }
    assert_eq!(trainer.state().step, 50);
    assert!(
        losses[49] < losses[0],
        "loss went from {} to {}",
        losses[0],
        losses[49]
    );
}

#[test]
fn fit_checkpoints_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path()).unwrap();
    let tokens = repeating_text();
    let (train_tokens, eval_tokens) = tokens.split_at(tokens.len() - 100);

    let conf = TrainConfig {
        eval_interval: 2,
        eval_batches: 2,
        checkpoint_interval: 3,
        grad_accum_steps: 2,
        ..train_config(6)
    };
    let train = DataLoader::new(TokenWindows::new(train_tokens.to_vec(), 16).unwrap(), 4)
        .shuffle(1)
        .drop_last(true);
    let eval = DataLoader::new(TokenWindows::new(eval_tokens.to_vec(), 16).unwrap(), 4);

    let model = Transformer::new(model_config(), 3).unwrap();
    let mut trainer = Trainer::new(model, conf.clone()).unwrap();
    let summary = trainer.fit(&train, Some(&eval), &store).unwrap();
    assert_eq!(summary.last.unwrap().step, 6);
    assert!(summary.best_eval_loss.is_some());
    assert!(dir.path().join("best.ckpt").exists());
    assert!(dir.path().join("step-00000003.ckpt").exists());

    let latest = store.latest().unwrap().unwrap();
    assert_eq!(latest.step, 6);
    let checkpoint = store.load(&latest).unwrap();
    assert_eq!(checkpoint, trainer.checkpoint());

    let mut resumed = Trainer::resume(
        checkpoint,
        TrainConfig {
            max_steps: 8,
            decay_steps: 8,
            ..conf
        },
    )
    .unwrap();
    assert_eq!(resumed.state().step, 6);
    assert_eq!(resumed.state().best_eval_loss, summary.best_eval_loss);
    assert_eq!(resumed.model().params(), trainer.model().params());

    let summary = resumed.fit(&train, Some(&eval), &store).unwrap();
    assert_eq!(summary.last.unwrap().step, 8);
    assert_eq!(store.latest().unwrap().unwrap().step, 8);
    assert_eq!(resumed.state().optimizer.step, 8);
}

#[test]
fn empty_training_data_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path()).unwrap();
    let train = DataLoader::new(TokenWindows::new(vec![1, 2, 3], 16).unwrap(), 4);
    let model = Transformer::new(model_config(), 0).unwrap();
    let mut trainer = Trainer::new(model, train_config(5)).unwrap();
    assert!(trainer.fit(&train, None, &store).is_err());
    assert_eq!(trainer.state().step, 0);
}
