/*!
# Portfolio Backend

A multi-user backend that stores student portfolios as JSON documents in Google Drive.

## Overview

Students edit their portfolio in a static web page and sign in with Google. The page
sends the portfolio document to this service, which validates it and files it away in a
per-student folder. Administrators can list, download and index every stored portfolio.

## Architecture

### Storage Layout
- **Temporary tier**: every save first lands in a timestamped file inside the temp folder
- **Final tier**: one folder per student (`user_<email>`) under the final folder, holding
  one current file per portfolio name with its version recorded in tags
- **Legacy files**: JSON exports placed directly in the parent folder are still listed

### Save Pipeline
1. Write a temporary copy
2. Validate the document (personal info, achievements, reflections, roll number);
   a rejected document has its temporary copy deleted
3. Create or update the final file, bumping the version
4. Delete the temporary copy
5. Prune duplicates and old revisions
6. Empty the service account's trash in the storage folders
7. Sweep expired temporary files

### Backend Layer
- **Technologies**: Rust, axum, tokio, reqwest
- **Core Components**:
  - Storage abstraction with a Drive v3 client and an in-memory backend
  - Token verification against Google's identity endpoints
  - Maintenance routines for temp cleanup and quota monitoring

## Modules

- **drive**: Storage trait, file metadata and query filters
- **google**: Drive v3 REST client
- **memory**: In-process storage used by tests and `--in-memory`
- **portfolio**: Portfolio document model and validation
- **loader**: Reading and normalizing portfolio files from disk
- **layout**: Folder naming, tags and the folder cache
- **saving**: The two-tier save pipeline and cleanup of related files
- **downloader**: Listing, download, deletion and manifest generation
- **maintenance**: Temporary-file cleanup and storage monitoring
- **login**: Bearer-token authentication middleware
- **config**: Settings shared by the server and the maintenance tool
- **error**: HTTP error mapping
- **app**: Routing and middleware

## REST API Endpoints

- `GET /`, `GET /healthz` - Service information and liveness
- `POST /api/save` - Save the caller's portfolio
- `GET /api/user-portfolios` - The caller's stored portfolios
- `GET /api/user-portfolio?id=|filename=` - One of the caller's portfolios, or the newest
- `DELETE /api/user-portfolio/{id}` - Delete one of the caller's portfolios
- `GET /api/user-drive-portfolio` - Portfolio kept in the caller's own Drive
- `GET /api/list` - Every portfolio (admin)
- `GET /api/download?id=` - Raw portfolio content (admin)
- `POST /api/generate-manifest` - Index of every portfolio (admin)
- `POST /api/cleanup-temp-files` - Remove expired temporary files (admin)
- `GET /api/storage-status` - Quota and per-user file counts (admin)
*/

pub mod app;
pub mod config;
pub mod downloader;
pub mod drive;
pub mod error;
pub mod google;
pub mod layout;
pub mod loader;
pub mod login;
pub mod maintenance;
pub mod memory;
pub mod portfolio;
pub mod saving;

pub use drive::{Drive, DriveError, DriveFile, FileFilter};
pub use error::AppError;
pub use layout::{PortfolioStore, StorageLayout};
pub use memory::MemoryDrive;
pub use portfolio::{Portfolio, Record, ValidationError};
