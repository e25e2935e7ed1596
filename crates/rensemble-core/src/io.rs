//! ファイルI/Oユーティリティ（gzip対応・アトミック書き込み）

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use tempfile::NamedTempFile;

const READER_BUF_CAP: usize = 128 * 1024; // 128 KiB

fn is_gzip(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("gz"))
}

/// 拡張子 `.gz` なら展開しながら読むリーダーを返す
pub fn open_reader<P: AsRef<Path>>(path: P) -> io::Result<Box<dyn BufRead + Send>> {
    let p = path.as_ref();
    let f = File::open(p)?;
    if is_gzip(p) {
        let dec = flate2::read::GzDecoder::new(f);
        return Ok(Box::new(BufReader::with_capacity(READER_BUF_CAP, dec)));
    }
    Ok(Box::new(BufReader::with_capacity(READER_BUF_CAP, f)))
}

/// Writer wrapper to propagate finish/close errors for compressed outputs.
#[must_use = "call .close() to propagate compression/IO errors"]
pub enum Writer {
    Plain(BufWriter<File>),
    Gz(flate2::write::GzEncoder<BufWriter<File>>),
}

impl Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Writer::Plain(f) => f.write(buf),
            Writer::Gz(e) => e.write(buf),
        }
    }
    fn flush(&mut self) -> io::Result<()> {
        match self {
            Writer::Plain(f) => f.flush(),
            Writer::Gz(e) => e.flush(),
        }
    }
}

impl Writer {
    fn new(file: File, gzip: bool) -> Self {
        let buffered = BufWriter::new(file);
        if gzip {
            Writer::Gz(flate2::write::GzEncoder::new(buffered, flate2::Compression::default()))
        } else {
            Writer::Plain(buffered)
        }
    }

    /// Finalize the stream and flush the underlying file.
    pub fn close(self) -> io::Result<File> {
        let buffered = match self {
            Writer::Plain(f) => f,
            Writer::Gz(e) => e.finish()?,
        };
        buffered.into_inner().map_err(|e| e.into_error())
    }
}

/// 拡張子 `.gz` なら圧縮して書くライターを返す
pub fn open_writer<P: AsRef<Path>>(path: P) -> io::Result<Writer> {
    let p = path.as_ref();
    let f = File::create(p)?;
    Ok(Writer::new(f, is_gzip(p)))
}

/// 一時ファイルへ書いてから rename する
///
/// 途中で失敗しても `path` の既存内容は壊れない。一時ファイルは `path` と同じ
/// ディレクトリに作るので rename はファイルシステムを跨がない。
pub fn write_atomic<P, F>(path: P, write_body: F) -> io::Result<()>
where
    P: AsRef<Path>,
    F: FnOnce(&mut Writer) -> io::Result<()>,
{
    let p = path.as_ref();
    let dir = p.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    let tmp = NamedTempFile::new_in(dir)?;
    let file = tmp.reopen()?;
    let mut writer = Writer::new(file, is_gzip(p));
    write_body(&mut writer)?;
    let file = writer.close()?;
    file.sync_all()?;
    tmp.persist(p).map_err(|e| e.error)?;
    Ok(())
}
