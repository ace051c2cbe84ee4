//! First-run helpers: `putarr get-token` and `putarr generate-config`.
//!
//! Token acquisition uses put.io's OOB flow: request a short code, have the
//! user enter it at <https://put.io/link>, and poll until put.io hands back
//! an OAuth token. These helpers talk to the user on stdout directly — they
//! run before logging is even configured.

use std::path::Path;
use std::time::Duration;

use crate::putio::{self, PutioError};

const OOB_POLL_INTERVAL: Duration = Duration::from_secs(3);

const CONFIG_TEMPLATE: &str = r#"# Required. Username and password that sonarr/radarr use to connect to the proxy
username = "myusername"
password = "mypassword"

# Required. Directory where the proxy will download files to. This directory has to be readable by
# sonarr/radarr in order to import downloads
download_directory = "/path/to/downloads"

# Optional bind address, default "0.0.0.0"
bind_address = "0.0.0.0"

# Optional TCP port, default 9091
port = 9091

# Optional log level, default "info"
loglevel = "info"

# Optional UID, default 1000. Change the owner of the downloaded files to this UID. Requires root.
uid = 1000

# Optional polling interval in secs, default 10.
polling_interval = 10

# Optional skip directories when downloading, default ["sample", "extras"]
skip_directories = ["sample", "extras"]

# Optional number of orchestration workers, default 10. Unless there are many changes coming from
# put.io, you shouldn't have to touch this number. 10 is already overkill.
orchestration_workers = 10

# Optional number of download workers, default 4. This controls how many downloads we run in parallel.
download_workers = 4

[putio]
# Required. put.io API key. You can generate one using 'putarr get-token'
api_key = "{{PUTIO_API_KEY}}"

# [sonarr], [radarr] and [whisparr] are all optional, but you'll need at least one of them
[sonarr]
url = "http://mysonarrhost:8989/sonarr"
# Can be found in Settings -> General
api_key = "MYSONARRAPIKEY"

[radarr]
url = "http://myradarrhost:7878/radarr"
# Can be found in Settings -> General
api_key = "MYRADARRAPIKEY"
"#;

/// Obtain a put.io API token through the OOB flow. Blocks until the user
/// links the code.
pub async fn get_token() -> Result<String, PutioError> {
    println!();

    let oob_code = putio::get_oob().await?;
    println!("Go to https://put.io/link and enter the code: {oob_code}");
    println!("Waiting for token...");

    loop {
        tokio::time::sleep(OOB_POLL_INTERVAL).await;

        // Not linked yet shows up as an error; keep waiting.
        if let Ok(token) = putio::check_oob(&oob_code).await {
            println!("put.io API token: {token}");
            return Ok(token);
        }
    }
}

/// Generate a config file at `path`, running the token flow to fill in the
/// put.io API key. An existing file is backed up to `{path}.bak` first.
pub async fn generate_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Generating config {}", path.display());

    let api_key = get_token().await?;
    let config = CONFIG_TEMPLATE.replace("{{PUTIO_API_KEY}}", &api_key);

    if path.exists() {
        let mut backup = path.as_os_str().to_owned();
        backup.push(".bak");
        println!("Backing up config {}", path.display());
        std::fs::rename(path, &backup)?;
    }

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    println!("Writing {}", path.display());
    std::fs::write(path, config)?;

    Ok(())
}
