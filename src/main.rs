mod controller;
mod executor;
mod flocking;
mod logging;
mod mission;
mod models;
mod scenario;
mod simulation;

use clap::{Arg, ArgAction, Command};
use std::str::FromStr;

use controller::{MissionController, MissionReport};
use executor::Executor;
use logging::{LogConfig, LogOutput};
use mission::{MissionPlan, StepResult};
use scenario::MissionConfig;

fn main() {
    // コマンドライン引数の解析
    let matches = Command::new("swarmsim")
        .version("0.1.0")
        .about("群制御ミッションシミュレーション (Swarm Mission Simulation)")
        .long_about(
            "計画駆動型の群制御シミュレーションシステム\n\
             プランナが生成したステップ関数を安全に実行し、群の目標を段階的に切り替えます。",
        )
        .arg(
            Arg::new("mission")
                .short('s')
                .long("mission")
                .value_name("FILE")
                .help("ミッションファイル(.yaml)のパスを指定"),
        )
        .arg(
            Arg::new("plan")
                .short('p')
                .long("plan")
                .value_name("FILE")
                .help("プランナ出力(.yaml)でミッションファイルの計画を置き換え"),
        )
        .arg(
            Arg::new("info")
                .short('i')
                .long("info")
                .action(ArgAction::SetTrue)
                .help("ミッションの情報のみ表示して終了")
                .conflicts_with("check"),
        )
        .arg(
            Arg::new("check")
                .short('c')
                .long("check")
                .action(ArgAction::SetTrue)
                .help("全ステップ関数を検証・試行実行して結果を表示")
                .conflicts_with("info"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("詳細出力レベル (-v: 基本, -vv: 詳細, -vvv: デバッグ)"),
        )
        .arg(
            Arg::new("log-output")
                .long("log-output")
                .value_name("TARGET")
                .default_value("console")
                .help("ログ出力先 (console, file, both)"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("ログレベル (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("log-dir")
                .long("log-dir")
                .value_name("DIR")
                .default_value("logs")
                .help("ログファイルの出力ディレクトリ"),
        )
        .get_matches();

    println!("群制御ミッションシミュレーション - swarmsim v0.1.0");
    println!();

    let verbose_level = matches.get_count("verbose");
    if verbose_level > 0 {
        println!("詳細出力レベル: {}", verbose_level);
    }

    // ログ設定
    let mut log_config = LogConfig::from_verbosity(verbose_level);
    if let Some(level) = matches.get_one::<String>("log-level") {
        log_config.level = logging::parse_log_level(level);
    }
    if let Some(output) = matches.get_one::<String>("log-output") {
        match LogOutput::from_str(output) {
            Ok(output) => log_config.output = output,
            Err(e) => {
                eprintln!("エラー: {}", e);
                std::process::exit(1);
            }
        }
    }
    if let Some(dir) = matches.get_one::<String>("log-dir") {
        log_config.log_dir = dir.clone();
    }
    let _log_guard = match logging::init_logging(log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("エラー: ログ初期化に失敗しました: {}", e);
            std::process::exit(1);
        }
    };

    let Some(mission_path) = matches.get_one::<String>("mission") else {
        show_default_help();
        return;
    };

    let options = RunOptions {
        plan_path: matches.get_one::<String>("plan").cloned(),
        info_only: matches.get_flag("info"),
        check_only: matches.get_flag("check"),
        verbose_level,
    };

    match run_mission(mission_path, &options) {
        Ok(_) => {
            if verbose_level > 0 {
                println!("ミッション実行が正常に完了しました。");
            }
        }
        Err(e) => {
            eprintln!("エラー: {}", e);
            std::process::exit(1);
        }
    }
}

struct RunOptions {
    plan_path: Option<String>,
    info_only: bool,
    check_only: bool,
    verbose_level: u8,
}

/// ミッションファイルを読み込んで実行
fn run_mission(mission_path: &str, options: &RunOptions) -> Result<(), Box<dyn std::error::Error>> {
    let mission = MissionConfig::from_file(mission_path)?;

    if options.verbose_level > 0 {
        println!("ミッションファイル読み込み完了: {}", mission_path);
    }

    if options.info_only {
        mission.print_summary();
        return Ok(());
    }

    let plan = match &options.plan_path {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            mission::parse_plan_yaml(&text)?
        }
        None => mission.plan()?,
    };

    if options.check_only {
        return check_plan(&mission, &plan);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let report = runtime.block_on(execute_mission(&mission, plan, options.verbose_level))?;
    print_report(&report);

    Ok(())
}

/// ミッションの実行（完了・中止・最大ティック数・Ctrl-C まで）
async fn execute_mission(
    mission: &MissionConfig,
    plan: MissionPlan,
    verbose_level: u8,
) -> Result<MissionReport, Box<dyn std::error::Error>> {
    mission.print_summary();
    println!();

    let mut controller = MissionController::new(verbose_level);
    controller.start(mission, plan).await?;

    // Ctrl-C で停止要求（ティック境界で観測される）
    let stop_token = controller.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("中断要求を受信しました。ミッションを停止します...");
            stop_token.cancel();
        }
    });

    match controller.finish().await {
        Some(report) => Ok(report),
        None => Err("ミッションの結果を取得できませんでした".into()),
    }
}

/// 全ステップ関数の検証と試行実行
fn check_plan(mission: &MissionConfig, plan: &MissionPlan) -> Result<(), Box<dyn std::error::Error>> {
    let objects = mission.resolve_objects();
    let bbox = mission.world.mission_bbox();
    let mut executor = Executor::new(mission.sim.seed);
    let mut failures = 0;

    println!("=== ステップ関数の検証 ===");
    for (index, spec) in plan.iter() {
        match executor.execute(
            &spec.function_body,
            spec.function_type,
            mission.agents.count,
            &objects,
            &bbox,
        ) {
            Ok(result) => {
                println!("ステップ{} [{}] OK: {}", index, spec.function_type, spec.objective);
                print_step_result(&result);
            }
            Err(e) => {
                failures += 1;
                println!("ステップ{} [{}] 失敗: {}", index, spec.function_type, e);
            }
        }
    }
    println!();

    if failures > 0 {
        return Err(format!("{}個のステップが検証に失敗しました", failures).into());
    }
    println!("全{}ステップの検証に成功しました。", plan.len());
    Ok(())
}

fn print_step_result(result: &StepResult) {
    match result {
        StepResult::Coordinates(coordinates) => {
            for (i, c) in coordinates.iter().enumerate() {
                println!("    エージェント{}: ({:.1}, {:.1})", i, c.x, c.y);
            }
        }
        StepResult::Roles(roles) => println!("    役割: {:?}", roles),
        StepResult::Groups(groups) => {
            let labels: Vec<String> = groups.iter().map(|g| g.to_string()).collect();
            println!("    グループ: {:?}", labels);
        }
    }
}

fn print_report(report: &MissionReport) {
    let snapshot = &report.snapshot;

    println!();
    println!("=== ミッション結果 ===");
    println!("最終状態: {}", snapshot.state);
    println!("総ティック数: {}", snapshot.tick);
    if let Some(reason) = &report.abort_reason {
        println!("中止理由: {}", reason);
    }
    println!();

    println!("=== ステップ進捗 ===");
    if snapshot.progress.steps.is_empty() {
        println!("(進捗は破棄されました)");
    }
    for step in &snapshot.progress.steps {
        let mark = if step.completed { "完了" } else { "未完了" };
        println!("  {:>3}: [{}] {}", step.step, mark, step.objective);
    }
    println!();

    println!("=== 検知結果 ===");
    println!("検知済みオブジェクト: {}/{}", report.objects_detected, report.objects_total);
    println!("検知イベント数: {}", report.detection_stats.total_detections);
    println!("初回検知数: {}", report.detection_stats.first_detections);
    println!("報告中のエージェント: {}機", report.detection_stats.agents_reporting);
}

/// デフォルトヘルプを表示
fn show_default_help() {
    println!("使用方法:");
    println!("  swarmsim [オプション]");
    println!();
    println!("オプション:");
    println!("  -s, --mission <FILE>   ミッションファイルを指定して実行");
    println!("  -p, --plan <FILE>      プランナ出力で計画を置き換え");
    println!("  -i, --info             ミッション情報のみ表示");
    println!("  -c, --check            ステップ関数の検証と試行実行");
    println!("  -v, --verbose          詳細出力 (複数指定で詳細レベル上昇)");
    println!("      --log-output       ログ出力先 (console, file, both)");
    println!("      --log-level        ログレベル");
    println!("      --log-dir          ログディレクトリ");
    println!("  -h, --help             このヘルプを表示");
    println!();
    println!("利用可能なミッションファイル:");
    println!("  missions/hurricane_survey.yaml   - ハリケーン被災地の調査");
    println!();
    println!("例:");
    println!("  swarmsim -s missions/hurricane_survey.yaml");
    println!("  swarmsim -s missions/hurricane_survey.yaml -v");
    println!("  swarmsim -s missions/hurricane_survey.yaml -i");
    println!("  swarmsim -s missions/hurricane_survey.yaml -c");
}
