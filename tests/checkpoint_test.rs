use std::fs;

use nanolm::{
    Batch, Checkpoint, CheckpointHandle, CheckpointStore, FileCheckpointStore, LmError,
    ModelConfig, PositionEncoding, Sample, TrainConfig, Trainer, Transformer,
};

fn trained(position: PositionEncoding) -> Trainer {
    let conf = ModelConfig {
        position,
        shared_weights: false,
        ..ModelConfig::new(8, 1, 2, 20, 8)
    };
    let model = Transformer::new(conf, 5).unwrap();
    let mut trainer = Trainer::new(model, TrainConfig::default()).unwrap();
    let batch = Batch::new(vec![Sample::from_tokens(&[1, 5, 9, 2, 7]).unwrap()]);
    for _ in 0..3 {
        trainer.train_step(std::slice::from_ref(&batch)).unwrap();
    }
    trainer
}

#[test]
fn save_then_load_is_bit_exact() {
    for position in [PositionEncoding::Rotary, PositionEncoding::Learned] {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        let trainer = trained(position);
        let handle = store.save(&trainer.checkpoint()).unwrap();
        assert_eq!(handle.step, 3);

        let loaded = store.load(&handle).unwrap();
        assert_eq!(loaded.config.position, position);
        assert_eq!(loaded.optimizer.step, 3);
        for ((name, a), (b_name, b)) in loaded.params.iter().zip(trainer.model().params().iter()) {
            assert_eq!(name, b_name);
            let same_bits = a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits());
            assert!(same_bits, "{name} differs");
        }
        assert_eq!(loaded, trainer.checkpoint());

        let model = loaded.to_model().unwrap();
        assert_eq!(
            model.forward(&[1, 2, 3]).unwrap(),
            trainer.model().forward(&[1, 2, 3]).unwrap()
        );
    }
}

#[test]
fn truncated_file_is_not_loadable() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path()).unwrap();
    let handle = store.save(&trained(PositionEncoding::Rotary).checkpoint()).unwrap();

    let bytes = fs::read(&handle.path).unwrap();
    for cut in [bytes.len() / 3, bytes.len() - 4, bytes.len() - 1] {
        fs::write(&handle.path, &bytes[..cut]).unwrap();
        assert!(matches!(store.load(&handle), Err(LmError::Checkpoint(_))));
    }
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path()).unwrap();
    let handle = CheckpointHandle {
        step: 1,
        path: dir.path().join("nope.ckpt"),
    };
    assert!(matches!(store.load(&handle), Err(LmError::Io(_))));
}

#[test]
fn foreign_files_are_ignored_by_latest() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path()).unwrap();
    fs::write(dir.path().join("step-notanumber.ckpt"), b"junk").unwrap();
    fs::write(dir.path().join("notes.txt"), b"junk").unwrap();
    assert_eq!(store.latest().unwrap(), None);

    let ckpt: Checkpoint = trained(PositionEncoding::Rotary).checkpoint();
    store.save(&ckpt).unwrap();
    assert_eq!(store.latest().unwrap().unwrap().step, 3);
}

#[test]
fn resume_rejects_mismatched_optimizer_state() {
    let mut ckpt = trained(PositionEncoding::Rotary).checkpoint();
    ckpt.optimizer.v.pop();
    assert!(matches!(
        Trainer::resume(ckpt, TrainConfig::default()),
        Err(LmError::Shape(_))
    ));
}
