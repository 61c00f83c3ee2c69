//! Synthetic Stereo Rig Calibration Demo
//!
//! Runs the full calibration pipeline over a simulated 640x480 stereo rig and
//! prints the estimated cameras, the rig transform and the reprojection errors
//! next to the ground truth.
//!
//! Usage:
//! ```bash
//! cargo run --example synthetic_rig -- \
//!   --poses 12 \
//!   --fail-right 3 --fail-left 7 \
//!   --noise 0.3 \
//!   --output output/rig.yaml
//! ```

use clap::Parser;
use flexi_logger::{colored_default_format, Logger};
use log::{error, info};
use std::path::PathBuf;
use stereo_calib::calibration::PipelineOutcome;
use stereo_calib::simulation::{SyntheticDetector, SyntheticRig, SyntheticStore};
use stereo_calib::util::export_correspondences;
use stereo_calib::{
    CalibrationPipeline, CameraParameters, CameraSide, NativeSolver, PipelineConfig,
};

/// Stereo calibration on a simulated rig
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Pipeline configuration YAML; board and pose count come from the flags otherwise
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Number of board poses to simulate
    #[arg(short = 'n', long, default_value = "12")]
    poses: usize,

    /// Inner corner rows of the checkerboard
    #[arg(long, default_value = "6")]
    rows: usize,

    /// Inner corner columns of the checkerboard
    #[arg(long, default_value = "9")]
    cols: usize,

    /// Poses whose left image has no detectable board
    #[arg(long, value_delimiter = ',')]
    fail_left: Vec<usize>,

    /// Poses whose right image has no detectable board
    #[arg(long, value_delimiter = ',')]
    fail_right: Vec<usize>,

    /// Standard deviation of the corner noise, in pixels
    #[arg(long, default_value = "0.0")]
    noise: f64,

    /// Seed for the corner noise
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Where to write the calibration as YAML
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Directory for CSV dumps of the accepted correspondences
    #[arg(long)]
    csv_dir: Option<PathBuf>,
}

fn print_camera(parameters: &CameraParameters, truth: &CameraParameters) {
    let estimated = &parameters.camera.intrinsics;
    let expected = &truth.camera.intrinsics;
    println!("\n📷 {} camera", parameters.side);
    println!(
        "   fx={:.3} fy={:.3} cx={:.3} cy={:.3}",
        estimated.fx, estimated.fy, estimated.cx, estimated.cy
    );
    println!(
        "   (truth fx={:.3} fy={:.3} cx={:.3} cy={:.3})",
        expected.fx, expected.fy, expected.cx, expected.cy
    );
    println!("   distortion: {:?}", parameters.distortion());
    println!("   (truth {:?})", truth.distortion());
    println!(
        "   RMS reprojection error: {:.6} px",
        parameters.reprojection_error()
    );
    println!("   {:?}", parameters.reprojection.statistics);
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    Logger::try_with_str("info")?
        .format(colored_default_format)
        .start()?;

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => {
            info!("Loading pipeline configuration from {}", path.display());
            PipelineConfig::load_from_yaml(path)?
        }
        None => PipelineConfig::new(cli.rows, cli.cols, cli.poses),
    };

    let rig = SyntheticRig::standard(config.target()?, config.pose_count);
    let mut detector = SyntheticDetector::new(&rig).with_noise(cli.noise, cli.seed);
    for &pose in &cli.fail_left {
        detector = detector.with_failure(pose, CameraSide::Left);
    }
    for &pose in &cli.fail_right {
        detector = detector.with_failure(pose, CameraSide::Right);
    }

    println!("🎯 STEREO RIG CALIBRATION");
    println!("=========================");
    println!(
        "Board {}x{} inner corners, {} poses, noise σ={} px\n",
        config.inner_corner_rows, config.inner_corner_cols, config.pose_count, cli.noise
    );

    let mut pipeline =
        CalibrationPipeline::new(config, SyntheticStore::new(&rig), detector, NativeSolver::new())?;
    let summary = pipeline.examine_poses();
    println!(
        "\n✅ Number of valid images is {}/{}",
        summary.valid_count(),
        summary.total
    );

    if let Some(dir) = &cli.csv_dir {
        for side in CameraSide::BOTH {
            export_correspondences(
                pipeline.store(),
                side,
                dir.join(format!("{}_correspondences.csv", side.orientation())),
            )?;
        }
    }

    let calibration = match pipeline.calibrate(summary) {
        Ok(PipelineOutcome::Complete(calibration, _)) => calibration,
        Ok(PipelineOutcome::Aborted(_)) => {
            println!("❌ No valid chessboard poses, nothing to calibrate");
            return Ok(());
        }
        Err(e) => {
            error!("{e}");
            println!("❌ Calibration failed at the {} stage: {}", e.stage, e.source);
            return Ok(());
        }
    };

    print_camera(&calibration.left, &rig.ground_truth(CameraSide::Left)?);
    print_camera(&calibration.right, &rig.ground_truth(CameraSide::Right)?);

    let stereo = &calibration.stereo;
    println!("\n🔗 Stereo");
    println!("   R = {:.6}", stereo.rotation);
    println!("   (truth R = {:.6})", rig.relative.rotation_matrix());
    println!("   T = {:.6}", stereo.translation);
    println!("   (truth T = {:.6})", rig.relative.translation);
    println!("   E = {:.6}", stereo.essential);
    println!("   F = {:.6}", stereo.fundamental);
    println!("   Stereo RMS error: {:.6} px", stereo.rms_error);

    println!("\n📊 Summary");
    println!(
        "   Left camera error:  {:.6} px",
        calibration.left.reprojection_error()
    );
    println!(
        "   Right camera error: {:.6} px",
        calibration.right.reprojection_error()
    );
    println!("   Stereo error:       {:.6} px", stereo.rms_error);

    if let Some(path) = &cli.output {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        calibration.save_to_yaml(path)?;
        println!("\n💾 Calibration written to {}", path.display());
    }

    Ok(())
}
