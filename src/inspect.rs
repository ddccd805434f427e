use term_table::row::Row;
use term_table::table_cell::{Alignment, TableCell};
use term_table::{Table, TableStyle};

/// Debug inspector: render sorted strings next to their LCP and
/// distinguishing-character columns.
#[allow(unused)]
pub fn inspect(strings: &[&[u8]], lcps: &[usize], cache: &[u8]) {
    let mut table = Table::new();
    table.style = TableStyle::blank();
    table.separate_rows = false;
    let align = Alignment::Right;

    let mut head = vec![TableCell::new("")];
    head.push(TableCell::new_with_alignment("string", 1, align));
    head.push(TableCell::new_with_alignment("lcp", 1, align));
    head.push(TableCell::new_with_alignment("cache", 1, align));
    table.add_row(Row::new(head));

    for (i, s) in strings.iter().enumerate() {
        let mut row = vec![TableCell::new(format!("[{}]", i))];
        row.push(TableCell::new_with_alignment(
            String::from_utf8_lossy(s),
            1,
            align,
        ));
        let lcp = match lcps.get(i) {
            Some(l) if i > 0 => l.to_string(),
            _ => String::new(),
        };
        row.push(TableCell::new_with_alignment(lcp, 1, align));
        let c = match cache.get(i) {
            Some(&c) if i > 0 => format!("{:#04x}", c),
            _ => String::new(),
        };
        row.push(TableCell::new_with_alignment(c, 1, align));
        table.add_row(Row::new(row));
    }

    eprintln!("{}", table.render());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_without_panicking() {
        let strings: Vec<&[u8]> = vec![b"ban", b"band", b"bandana"];
        let lcps = vec![0usize, 3, 4];
        let cache = vec![0u8, b'd', b'a'];
        inspect(&strings, &lcps, &cache);
    }
}
