use colored::*;

pub fn print_banner() {
    let banner = r#"
  ___       _                          _      ____       _
 |_ _|_ __ | |_ ___ _ __ ___ ___ _ __ | |_   / ___| __ _| |_ _____      ____ _ _   _
  | || '_ \| __/ _ \ '__/ __/ _ \ '_ \| __| | |  _ / _` | __/ _ \ \ /\ / / _` | | | |
  | || | | | ||  __/ | | (_|  __/ |_) | |_  | |_| | (_| | ||  __/\ V  V / (_| | |_| |
 |___|_| |_|\__\___|_|  \___\___| .__/ \__|  \____|\__,_|\__\___| \_/\_/ \__,_|\__, |
                                |_|                                            |___/
    "#;

    println!("{}", banner.bright_cyan().bold());
    println!("{}", "   Inspect, extract and audit every upload on its way in".bright_white().italic());
    println!("{}", "   ======================================================".bright_black());
    println!();
}

pub fn print_startup_info(listen: &str, backend: &str, rules: &str, uploader: &str) {
    println!("{}", "   Gateway configuration".bright_white().bold());
    println!("   {:<10} {}", "Listen".bright_black(), listen.bright_green());
    println!("   {:<10} {}", "Backend".bright_black(), backend.bright_green());
    println!("   {:<10} {}", "Rules".bright_black(), rules);
    println!("   {:<10} {}", "Storage".bright_black(), uploader);
    println!();
    tracing::info!(
        "Gateway listening on {} forwarding to {} (rules {}, storage {})",
        listen,
        backend,
        rules,
        uploader
    );
}

pub fn print_step(msg: &str) {
    println!("{} {}", "➜".bright_blue().bold(), msg);
    tracing::info!("STEP: {}", msg);
}

pub fn print_success(msg: &str) {
    println!("{} {}", "✔".bright_green().bold(), msg);
    tracing::info!("SUCCESS: {}", msg);
}

pub fn print_warning(msg: &str) {
    println!("{} {}", "⚠".bright_yellow().bold(), msg);
    tracing::warn!("WARNING: {}", msg);
}

pub fn print_error(msg: &str) {
    println!("{} {}", "✘".bright_red().bold(), msg);
    tracing::error!("ERROR: {}", msg);
}
