#[macro_use]
extern crate clap;

use std::fs;
use std::io::BufWriter;
use std::mem;
use std::process;
use std::time;

use byteorder::{NativeEndian, WriteBytesExt};
use libc::{getrusage, rusage, RUSAGE_SELF};
use psss::{sort, sort_lcp};

fn main() {
    let matches = clap_app!(psss =>
        (about: "parallel string sample sort timing tool")
        (@arg TIMES: -t --times +takes_value "repeat multiple times")
        (@arg LCP: -l --lcp "compute the lcp array as well")
        (@arg CHECK: -c --check "verify the sorted order")
        (@arg LCPOUT: -o --lcpout +takes_value "write the lcp array to a file")
        (@arg INPUT: +required "line file to sort")
    )
    .get_matches();

    let input_file = matches.value_of("INPUT").unwrap();
    let with_lcp = matches.is_present("LCP") || matches.is_present("LCPOUT");
    let check_order = matches.is_present("CHECK");
    let repeat_times = Ord::max(
        matches
            .value_of("TIMES")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(1),
        1,
    );

    let data = match fs::read(&input_file) {
        Ok(data) => data,
        Err(err) => {
            eprintln!("error: {:?}", err);
            process::exit(1);
        }
    };
    let lines: Vec<&[u8]> = data.split(|&b| b == b'\n').filter(|l| !l.is_empty()).collect();
    eprintln!(
        "load {} strings ({} bytes) from `{}`",
        lines.len(),
        data.len(),
        input_file
    );

    let mut strings = Vec::new();
    let mut lcps = vec![0usize; lines.len()];
    let mut times = String::new();
    for _ in 0..repeat_times {
        strings = lines.clone();
        let ((), dur) = timeit(|| {
            if with_lcp {
                sort_lcp(&mut strings[..], &mut lcps[..])
            } else {
                sort(&mut strings[..])
            }
        });
        times.push_str(format!("{:.3}s ", dur.as_secs_f64()).as_str());
    }
    eprintln!(" time: {}", times);
    eprintln!("  rss: {:.3}MiB", get_peak_rss_kib() as f64 / 1024.0);

    if check_order {
        eprintln!("check: {}", check(&strings[..]));
    }

    if let Some(outname) = matches.value_of("LCPOUT") {
        let mut file = BufWriter::new(fs::File::create(outname).unwrap());
        lcps.iter()
            .for_each(|&l| file.write_u64::<NativeEndian>(l as u64).unwrap());
        eprintln!("store lcp file `{}` of {} bytes", outname, 8 * lcps.len());
    }
}

fn timeit<F, T>(f: F) -> (T, time::Duration)
where
    F: FnOnce() -> T,
{
    let start = time::Instant::now();
    let ret = f();
    let dur = start.elapsed();
    (ret, dur)
}

fn get_peak_rss_kib() -> u64 {
    let mut ru;
    unsafe {
        ru = mem::zeroed::<rusage>();
        getrusage(RUSAGE_SELF, &mut ru as *mut rusage);
    }
    ru.ru_maxrss as u64
}

fn check(strings: &[&[u8]]) -> bool {
    for i in 1..strings.len() {
        if strings[i - 1] > strings[i] {
            return false;
        }
    }
    true
}
