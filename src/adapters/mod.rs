pub mod ftp;
pub mod sftp;
pub mod webdav;
