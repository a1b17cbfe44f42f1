use std::fs;

use loopframe_contracts::assets::AssetLoader;
use loopframe_contracts::events::EventWriter;
use loopframe_contracts::plan::ScenePlan;
use loopframe_contracts::runs::clips::build_loop_clips;
use loopframe_contracts::runs::keyframes::KeyframeAssetMap;
use loopframe_engine::{
    DryrunImageService, EventLogObserver, KeyframeSynthesizer, ReferencePosePool, SynthState,
    SynthesisOptions,
};
use serde_json::Value;

const PLAN_JSON: &str = r#"{
    "title": "Rooftop Bachata",
    "description": "Four moves at dusk",
    "backend_tags": ["bachata", "loop"],
    "character_leader_desc": "Leader in a charcoal linen suit",
    "character_follower_desc": "Follower in a flowing red dress",
    "setting_desc": "City rooftop at golden hour",
    "scenes": [
        {"scene_number": 1, "action_description": "Basic step", "audio_prompt": "Guitar intro",
         "start_pose_description": "Closed hold, facing camera", "end_pose_description": "Open hold"},
        {"scene_number": 2, "action_description": "Outside turn", "audio_prompt": "Bongo fill",
         "start_pose_description": "Open hold", "end_pose_description": "Side by side"},
        {"scene_number": 3, "action_description": "Shadow position", "audio_prompt": "Bass drop",
         "start_pose_description": "Side by side", "end_pose_description": "Dip"},
        {"scene_number": 4, "action_description": "Recover", "audio_prompt": "Outro",
         "start_pose_description": "Dip", "end_pose_description": "Closed hold, facing camera"}
    ]
}"#;

#[test]
fn dryrun_run_writes_keyframes_journal_and_loop_clips() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let prompts_dir = temp.path().join("prompts");
    fs::create_dir_all(&prompts_dir)?;
    let loader = AssetLoader::new(&prompts_dir);
    let poses = ReferencePosePool::new(loader.load_reference_poses()?);
    assert!(poses.is_empty());

    let plan = ScenePlan::from_json_str(PLAN_JSON)?;
    let run_dir = temp.path().join("run");
    let journal = run_dir.join("events.jsonl");
    let observer = EventLogObserver::new(EventWriter::new(&journal, "it-run"));
    let service = DryrunImageService;

    let outcome = KeyframeSynthesizer::new(&service, &loader, SynthesisOptions::default())
        .with_poses(poses)
        .with_observer(&observer)
        .run(&plan, &run_dir);

    assert_eq!(outcome.state, SynthState::Complete);
    assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);
    assert_eq!(outcome.assets.labels(), vec!["A", "B", "C", "D"]);
    for (_, path) in outcome.assets.iter() {
        let bytes = fs::read(path)?;
        assert_eq!(image::guess_format(&bytes)?, image::ImageFormat::Png);
    }

    let manifest = run_dir.join("keyframes.json");
    outcome.assets.write_manifest(&manifest)?;
    assert_eq!(KeyframeAssetMap::load_manifest(&manifest)?, outcome.assets);

    let clips = build_loop_clips(&plan, &outcome.assets)?;
    assert_eq!(clips.len(), 4);
    assert_eq!(clips[3].start_image, run_dir.join("keyframe_D.png"));
    assert_eq!(clips[3].end_image, run_dir.join("keyframe_A.png"));

    let saved = fs::read_to_string(&journal)?
        .lines()
        .map(serde_json::from_str::<Value>)
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|row| row["type"] == "keyframe_saved")
        .count();
    assert_eq!(saved, 4);
    Ok(())
}

#[test]
fn concurrent_runs_share_one_pose_pool() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let prompts_dir = temp.path().join("prompts");
    fs::create_dir_all(&prompts_dir)?;
    let reference = image::RgbImage::from_pixel(32, 64, image::Rgb([200, 40, 90]));
    reference.save(prompts_dir.join("reference_pose_01.png"))?;
    reference.save(prompts_dir.join("reference_pose_02.png"))?;

    let loader = AssetLoader::new(&prompts_dir);
    let poses = ReferencePosePool::new(loader.load_reference_poses()?);
    assert_eq!(poses.len(), 2);
    let plan = ScenePlan::from_json_str(PLAN_JSON)?;

    let handles: Vec<_> = (0..3)
        .map(|idx| {
            let poses = poses.clone();
            let loader = loader.clone();
            let plan = plan.clone();
            let run_dir = temp.path().join(format!("run-{idx}"));
            std::thread::spawn(move || {
                let mut options = SynthesisOptions::default();
                options.reference_pose_index = Some(idx);
                KeyframeSynthesizer::new(&DryrunImageService, &loader, options)
                    .with_poses(poses)
                    .run(&plan, &run_dir)
            })
        })
        .collect();

    for handle in handles {
        let outcome = handle
            .join()
            .map_err(|_| anyhow::anyhow!("synthesis thread panicked"))?;
        assert!(outcome.is_complete());
        assert_eq!(outcome.assets.len(), 4);
    }
    Ok(())
}
