//! End-to-end exercise of the greylisting engine: records fed through
//! the grey pipe into a running updater task, then a scanner pass over
//! the shared database, with the row population tallied at each step.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::PoisonError;

use tokio::{io::AsyncWriteExt as _, sync::broadcast};

use molasses_common::{
    config::{GreyConfig, WHITEEXP},
    record::{Record, RecordWriter},
    unix_now,
};
use molasses_grey::{
    db::{self, GreyData, GreyTuple, Key, SharedDb, PCOUNT_SPAMTRAP},
    firewall::DummyFw,
    GreyTimes, Scanner, Updater,
};

#[derive(Debug, Default, PartialEq, Eq)]
struct Tally {
    entries: usize,
    white: usize,
    grey: usize,
    trapped: usize,
    spamtrap: usize,
    white_passed: i32,
    white_blocked: i32,
    grey_passed: i32,
    grey_blocked: i32,
}

fn tally(db: &SharedDb) -> Tally {
    let guard = db.lock().unwrap_or_else(PoisonError::into_inner);
    let mut tally = Tally::default();

    for (key, val) in guard.entries().unwrap() {
        tally.entries += 1;
        match key {
            Key::Ip(_) => {
                if val.is_trapped() {
                    tally.trapped += 1;
                } else {
                    tally.white += 1;
                    tally.white_passed += val.pcount;
                    tally.white_blocked += val.bcount;
                }
            }
            Key::Mail(_) => tally.spamtrap += 1,
            Key::Tuple(_) => {
                tally.grey += 1;
                tally.grey_passed += val.pcount;
                tally.grey_blocked += val.bcount;
            }
        }
    }

    tally
}

fn grey(dst_ip: &str, ip: &str, to: &str) -> Record {
    Record::Grey {
        dst_ip: dst_ip.to_owned(),
        ip: ip.to_owned(),
        helo: String::from("jackiemclean.net"),
        from: String::from("m@jackiemclean.net"),
        to: to.to_owned(),
    }
}

fn white(source: &str, ip: &str, expires: i64) -> Record {
    Record::White {
        source: source.to_owned(),
        ip: ip.to_owned(),
        expires,
    }
}

fn trap(source: &str, ip: &str, expires: i64) -> Record {
    Record::Trap {
        source: source.to_owned(),
        ip: ip.to_owned(),
        expires,
    }
}

fn tuple_key(ip: &str, to: &str) -> Key {
    Key::Tuple(GreyTuple {
        ip: ip.to_owned(),
        helo: String::from("jackiemclean.net"),
        from: String::from("m@jackiemclean.net"),
        to: to.to_owned(),
    })
}

fn update_row(db: &SharedDb, key: &Key, update: impl FnOnce(&mut GreyData)) {
    let mut guard = db.lock().unwrap_or_else(PoisonError::into_inner);
    let mut row = guard.get(key).unwrap().expect("row should exist");
    update(&mut row);
    guard.put(key.clone(), row).unwrap();
}

#[tokio::test]
async fn records_flow_through_the_updater_and_scanner() {
    let now = unix_now();
    let db = db::memory();

    // A spamtrap address, as the admin tooling would seed it.
    db.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .put(
            Key::Mail(String::from("trap@test.com")),
            GreyData {
                first: now,
                pass: 0,
                expire: 0,
                bcount: 1,
                pcount: PCOUNT_SPAMTRAP,
            },
        )
        .unwrap();

    let (shutdown, _) = broadcast::channel(1);
    let updater = Updater::new(
        db.clone(),
        GreyTimes::from(&GreyConfig::default()),
        Some(String::from("192.179.21.3")),
    );

    let (pipe, updater_end) = tokio::io::duplex(64 * 1024);
    let reader = tokio::spawn(updater.run(updater_end, shutdown.subscribe()));
    let mut pipe = RecordWriter::new(pipe);

    // Three grey entries, then the same three again.
    for _ in 0..2 {
        for (dst, ip) in [
            ("2.3.4.5", "1.2.3.4"),
            ("2.3.1.5", "1.2.4.4"),
            ("2.3.2.5", "1.2.2.4"),
        ] {
            pipe.write_record(&grey(dst, ip, "r@hotmail.com")).await.unwrap();
        }
    }

    // White entries, twice over.
    for _ in 0..2 {
        pipe.write_record(&white("2.3.4.5", "4.3.2.1", now + 3600)).await.unwrap();
        pipe.write_record(&white("2.3.4.6", "4.3.2.2", now + 3600)).await.unwrap();
        pipe.write_record(&white("2.3.4.7", "4.3.2.3", now + 3600)).await.unwrap();
    }

    // Trap entries, twice over.
    for _ in 0..2 {
        pipe.write_record(&trap("3.2.4.5", "3.4.2.1", now + 3600)).await.unwrap();
        pipe.write_record(&trap("3.2.4.6", "3.4.2.2", now + 3600)).await.unwrap();
        pipe.write_record(&trap("3.2.4.7", "3.4.3.2", now + 3600)).await.unwrap();
    }

    // An already-expired white and trap entry.
    pipe.write_record(&white("8.8.8.3", "7.7.6.5", now - 3600)).await.unwrap();
    pipe.write_record(&trap("8.8.8.5", "7.7.6.6", now - 120)).await.unwrap();

    // A malformed record must not disturb anything after it.
    pipe.inner_mut().write_all(b"==\n%\n").await.unwrap();

    // Mail to the spamtrap address, twice.
    pipe.write_record(&grey("2.3.2.5", "1.2.2.4", "trap@test.com")).await.unwrap();
    pipe.write_record(&grey("2.3.2.5", "1.2.2.4", "trap@test.com")).await.unwrap();

    // A whitelisting for an ip that also has a grey tuple.
    pipe.write_record(&white("2.3.4.7", "1.2.3.4", now + 3600)).await.unwrap();

    // A client connecting straight to the low-priority MX.
    pipe.write_record(&grey("192.179.21.3", "1.2.2.34", "notrap@test.com")).await.unwrap();

    // Closing the pipe ends the updater.
    drop(pipe);
    reader.await.unwrap();

    assert_eq!(
        tally(&db),
        Tally {
            entries: 15,
            white: 5,
            grey: 3,
            trapped: 6,
            spamtrap: 1,
            white_passed: 3,
            white_blocked: 0,
            grey_passed: 0,
            grey_blocked: 6,
        }
    );

    // Age two tuples so the scanner has an expiry and a promotion to do.
    update_row(&db, &tuple_key("1.2.2.4", "r@hotmail.com"), |row| {
        row.expire = now - 120;
    });
    update_row(&db, &tuple_key("1.2.4.4", "r@hotmail.com"), |row| {
        row.pass = now - 60;
    });

    let fw = DummyFw::default();
    let observer = fw.clone();
    let mut scanner = Scanner::new(
        db.clone(),
        Box::new(fw),
        "test traplist",
        "you have been trapped",
        "molasses-whitelist",
        WHITEEXP,
    );

    let (record, stats) = scanner.scan(now).unwrap();
    assert_eq!(stats.expired, 3);
    assert_eq!(stats.promoted, 1);

    match record {
        Record::Config { name, message, ips } => {
            assert_eq!(name, "test traplist");
            assert_eq!(message, "you have been trapped");
            // All five surviving traps, as host routes, sorted.
            assert_eq!(
                ips,
                [
                    "1.2.2.4/32",
                    "1.2.2.34/32",
                    "3.4.2.1/32",
                    "3.4.2.2/32",
                    "3.4.3.2/32",
                ]
            );
        }
        other => panic!("expected a config record, got {other:?}"),
    }

    assert_eq!(observer.set("test traplist").unwrap().len(), 5);
    // 4.3.2.1..4.3.2.3 collapse into two blocks, plus the two lone hosts.
    assert_eq!(observer.set("molasses-whitelist").unwrap().len(), 4);

    assert_eq!(
        tally(&db),
        Tally {
            entries: 13,
            white: 5,
            grey: 2,
            trapped: 5,
            spamtrap: 1,
            white_passed: 3,
            white_blocked: 2,
            grey_passed: 0,
            grey_blocked: 4,
        }
    );
}
