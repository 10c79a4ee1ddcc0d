//! Environment readiness check.

use anyhow::Result;

use crate::config::Settings;
use crate::notify::MailNotifier;
use crate::portal::chromium;
use crate::scheduler;

/// Check Chrome, portal configuration, data dir, schedule, and alerting.
pub async fn run() -> Result<()> {
    println!("Percolator Doctor");
    println!("=================");
    println!();

    let os = std::env::consts::OS;
    let arch = std::env::consts::ARCH;
    println!("OS:   {os}");
    println!("Arch: {arch}");
    println!();

    let settings = Settings::from_env();
    let mut ready = true;

    match chromium::find_chrome() {
        Some(path) => println!("[OK] Chrome found: {}", path.display()),
        None => {
            println!("[!!] Chrome NOT found. Install Chrome/Chromium or set PERC_CHROME.");
            ready = false;
        }
    }

    match &settings.portal_url {
        Some(url) => println!("[OK] Portal address configured: {url}"),
        None => {
            println!("[!!] PERC_PORTAL_URL not set; acquisition cannot run.");
            ready = false;
        }
    }

    if settings.portal_user.is_some() && settings.portal_pass.is_some() {
        println!("[OK] Portal credentials configured");
    } else {
        println!("[??] Portal credentials incomplete; login will rely on a live session");
    }

    match std::fs::create_dir_all(&settings.data_dir) {
        Ok(()) => println!("[OK] Data dir writable: {}", settings.data_dir.display()),
        Err(e) => {
            println!(
                "[!!] Data dir {} not writable: {e}",
                settings.data_dir.display()
            );
            ready = false;
        }
    }

    match scheduler::schedule_from(&settings.cron_expr) {
        Ok(_) => println!("[OK] Cron expression valid: {}", settings.cron_expr),
        Err(_) => {
            println!("[!!] Cron expression invalid: {}", settings.cron_expr);
            ready = false;
        }
    }

    if settings.mail.is_configured() {
        match MailNotifier::from_settings(&settings.mail) {
            Ok(Some(_)) => println!("[OK] Mail alerts configured"),
            _ => println!("[!!] Mail settings present but unusable; check host and addresses"),
        }
    } else {
        println!("[??] Mail not configured; threshold alerts will be logged only");
    }

    match &settings.api_key {
        Some(_) => println!("[OK] Refresh API key set"),
        None => println!("[??] PERC_API_KEY not set; the refresh endpoint stays closed"),
    }

    println!();
    if ready {
        println!("Status: READY");
    } else {
        println!("Status: NOT READY");
    }
    Ok(())
}
